#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cluster_provisioner::cli::run().await
}
