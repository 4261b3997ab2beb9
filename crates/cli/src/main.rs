use std::process::ExitCode;

fn main() -> ExitCode {
    loadout_cli::run()
}
