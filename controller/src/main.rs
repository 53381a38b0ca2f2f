mod action_log;
mod cli;
mod control;
mod host;
mod recorder;
mod relay;
mod sensors;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
