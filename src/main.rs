#[tokio::main]
async fn main() -> anyhow::Result<()> {
    filestore_billing::cli::run().await
}
