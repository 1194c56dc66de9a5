use std::process::ExitCode;

fn main() -> ExitCode {
    camsrvd::csd::main()
}
