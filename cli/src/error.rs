use std::process::ExitCode;

use nsbroker::BrokerError;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status when remote code or an expression raised
const REMOTE_FAULT: u8 = 2;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            match e.downcast_ref::<BrokerError>() {
                Some(BrokerError::RemoteExec(_) | BrokerError::RemoteEval(_)) => {
                    ExitCode::from(REMOTE_FAULT)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}
