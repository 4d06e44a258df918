//! Telegram transport and the Takopi main loop.

pub mod api;
pub mod bridge;
pub mod file_transfer;
pub mod files;
pub mod poll;
pub mod presenter;
pub mod render;
pub mod runner_bridge;
pub mod topics;
pub mod transcribe;
pub mod transport;
pub mod types;

pub use api::BotClient;
pub use bridge::{run_main_loop, MainLoopOptions, TelegramBridgeConfig};
pub use presenter::TelegramPresenter;
pub use runner_bridge::{ExecBridgeConfig, RunningTask, RunningTasks};
pub use transport::TelegramTransport;
