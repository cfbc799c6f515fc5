fn main() -> anyhow::Result<()> {
    insight_worker_lib::run()
}
