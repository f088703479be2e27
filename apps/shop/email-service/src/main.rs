//! Email Service Entry Point

use core_config::tracing::install_color_eyre;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Install color-eyre first for colored error output
    install_color_eyre();

    shop_email_service::run().await.into()
}
