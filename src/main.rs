#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = cbt_session::run().await {
        eprintln!("cbt-session fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
