pub mod app;
pub mod auth;
pub mod config;
pub mod control;
pub mod dataplane;
pub mod logging;

pub async fn run(cli: config::Cli) -> std::process::ExitCode {
    app::run(cli).await
}
