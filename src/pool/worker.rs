//! Worker process entry point.
//!
//! A worker hosts one VM instance at a time. It reads framed
//! [`VerifyRequest`]s from stdin, runs the job, and writes one framed
//! [`VerifyReply`] per request to stdout. Anything wrong with the request
//! itself becomes an error reply; only process death counts as a crash,
//! and the supervisor handles that side.

use crate::pool::protocol::{VerifyReply, VerifyRequest, read_frame, write_frame};
use crate::types::encoding::{Decode, Encode};
use crate::utils::log::Logger;
use crate::vm::machine::Machine;
use std::io;
use std::process;

/// Runs the worker loop until stdin closes.
pub fn run() -> io::Result<()> {
    let logger = Logger::new(format!("worker:{}", process::id()));
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    while let Some(frame) = read_frame(&mut stdin)? {
        let reply = match VerifyRequest::from_bytes(&frame) {
            Ok(request) => evaluate(&request),
            Err(e) => VerifyReply::fail(format!("malformed request: {e}")),
        };
        if let Some(error) = &reply.error {
            logger.warn(error);
        }
        write_frame(&mut stdout, &reply.to_bytes())?;
    }
    Ok(())
}

/// Evaluates one request in a fresh VM.
fn evaluate(request: &VerifyRequest) -> VerifyReply {
    match request.to_job() {
        Ok(job) => VerifyReply::verdict(Machine::verify(&job)),
        Err(e) => VerifyReply::fail(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hash::TxHash;
    use crate::vm::assembler::Assembler;
    use crate::vm::isa::IrqKind;
    use crate::vm::machine::Job;

    fn request_for(kind: IrqKind) -> VerifyRequest {
        let mut asm = Assembler::new();
        asm.irq(kind);
        let job = Job::new(TxHash::zero(), asm.to_bytes().unwrap(), vec![]).unwrap();
        VerifyRequest::from_job(&job)
    }

    #[test]
    fn evaluate_success_script() {
        let reply = evaluate(&request_for(IrqKind::Success));
        assert_eq!(reply, VerifyReply::verdict(true));
    }

    #[test]
    fn evaluate_failure_script() {
        let reply = evaluate(&request_for(IrqKind::Failure));
        assert_eq!(reply, VerifyReply::verdict(false));
    }

    #[test]
    fn evaluate_bad_request_yields_error_reply() {
        let request = VerifyRequest {
            hash: "nonsense".to_string(),
            output: String::new(),
            input: String::new(),
        };
        let reply = evaluate(&request);
        assert!(!reply.result);
        assert!(reply.error.is_some());
    }
}
