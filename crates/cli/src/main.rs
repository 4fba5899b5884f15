use std::process::ExitCode;

fn main() -> ExitCode {
    revbridge_cli::run()
}
