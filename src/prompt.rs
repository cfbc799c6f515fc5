use crate::errors::AppResult;
use crate::models::TimeWindow;

/// SQL-generation instruction for one KPI. The windows are the only time
/// input the generator may use; they are embedded in the order given.
pub fn build_ai_prompt(base_query: &str, windows: &[TimeWindow]) -> AppResult<String> {
    let windows_json = serde_json::to_string_pretty(windows)?;
    Ok(format!(
        r#"You are an expert PostgreSQL SQL generator.

Base Query:
{base_query}

IMPORTANT (STRICT):
- DO NOT calculate dates or intervals.
- DO NOT use NOW(), CURRENT_TIMESTAMP, or clock functions.
- DO NOT infer or shift time.
- USE ONLY the provided interval timestamps exactly as given.

Provided Time Windows (MANDATORY):
Each object represents one window and must be used as-is.

{windows_json}

CTE Requirements (MANDATORY):
- Use CTEs exactly named:
  1. params
  2. series
  3. windows
  4. final

Window Requirements:
- Each window must include:
  - window_date
  - start_ts
  - end_ts
- Windows must appear in the same order as provided.
- Do NOT reorder or merge windows.

Base Query Handling (STRICT):
- Replace ONLY the date filter portion of the base query.
- Use: date_column >= start_ts
    AND date_column < end_ts
- Do NOT modify joins, grouping, filters, or aggregations.

Goal:
Generate a final PostgreSQL SQL query that:
- Uses the provided windows exactly
- Filters data using start_ts and end_ts
- Produces results per window
- Contains NO time calculations
"#
    ))
}
