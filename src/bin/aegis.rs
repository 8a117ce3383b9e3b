use aegis_security::{AppContext, config::Settings, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let ctx = AppContext::bootstrap(settings).await?;
    run(ctx).await
}
