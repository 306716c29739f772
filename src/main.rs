mod app;
mod cli;
mod config;
mod http;
mod logging;
mod net;
mod tunnel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
