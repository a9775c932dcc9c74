use std::process::ExitCode;

fn main() -> ExitCode {
    rehearse_cli::run()
}
