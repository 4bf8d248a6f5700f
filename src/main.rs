#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // load .env for local development (if present)
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    glyphchain::run().await
}
