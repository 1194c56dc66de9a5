pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod launcher;
pub mod notify;
pub mod registry;
pub mod relay;
pub mod shutdown;
pub mod signals;
pub mod singleton;
pub mod supervisor;

pub fn main() -> std::process::ExitCode {
    cli::run()
}
