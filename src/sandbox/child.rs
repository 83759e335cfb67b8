//! This module contains the request loop that runs inside the sandbox
//! process.
//!
//! The loop is independent of the process it runs in, so the `stg-sandbox`
//! binary only wires it to its standard streams.

use std::{
    io::{BufRead, Write},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    error::sandbox::{Error, Result},
    program::Program,
    sandbox::{
        interpreter::{self, Completion, Interpreter},
        protocol::{InvocationRequest, InvocationResponse, Outcome, Request, Response},
    },
};

/// The program loaded into the sandbox and the limits it runs with.
#[derive(Debug)]
struct Loaded {
    program: Arc<Program>,
    config:  interpreter::Config,
}

/// Serves requests read from `input`, writing responses to `output`, until a
/// shutdown request or the end of `input`.
///
/// Returns the exit code the process should exit with if the program asked
/// for one, in which case the invocation that asked gets no response.
///
/// # Errors
///
/// Returns [`Err`] if reading a request or writing a response fails. A request
/// that cannot be served is answered with [`Response::Rejected`] instead.
pub fn serve(input: impl BufRead, mut output: impl Write) -> Result<Option<i32>> {
    let mut loaded: Option<Loaded> = None;

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Received a malformed request");
                respond(&mut output, &Response::Rejected {
                    message: e.to_string(),
                })?;
                continue;
            }
        };

        let response = match request {
            Request::Load { program, config } => {
                info!(classes = program.classes().len(), "Loaded program");
                loaded = Some(Loaded { program, config });
                Response::Loaded
            }
            Request::Warmup => match &loaded {
                Some(_) => Response::WarmedUp,
                None => rejection(&Error::NotLoaded),
            },
            Request::Invoke(request) => match invoke(loaded.as_ref(), request) {
                Ok(Handled::Respond(response)) => response,
                Ok(Handled::Exit(code)) => {
                    info!(code, "Program requested exit");
                    return Ok(Some(code));
                }
                Err(e) => rejection(&e),
            },
            Request::Shutdown => {
                debug!("Shutting down");
                return Ok(None);
            }
        };
        respond(&mut output, &response)?;
    }

    Ok(None)
}

/// What the loop does after an invocation.
enum Handled {
    Respond(Response),
    Exit(i32),
}

fn invoke(loaded: Option<&Loaded>, request: InvocationRequest) -> Result<Handled> {
    let Loaded { program, config } = loaded.ok_or(Error::NotLoaded)?;
    let InvocationRequest { id, invocation } = request;
    debug!(id, method = %invocation.method, "Invoking");

    let execution = Interpreter::new(program, config.clone())
        .with_replay(invocation.replay.clone())
        .run(&invocation)?;
    let outcome = match execution.completion {
        Completion::Returned(value) => Outcome::Success { value },
        Completion::Threw {
            class,
            explicit: true,
        } => Outcome::ExplicitlyThrown { class },
        Completion::Threw {
            class,
            explicit: false,
        } => Outcome::ImplicitlyThrown { class },
        Completion::Exit(code) => {
            return Ok(Handled::Exit(i32::try_from(code).unwrap_or(i32::MAX)))
        }
    };

    Ok(Handled::Respond(Response::Invoked(InvocationResponse {
        id,
        outcome,
        coverage: execution.coverage,
        nd_log: execution.nd_log,
    })))
}

fn rejection(error: &Error) -> Response {
    warn!(error = %error, "Rejected request");
    Response::Rejected {
        message: error.to_string(),
    }
}

fn respond(output: &mut impl Write, response: &Response) -> Result<()> {
    serde_json::to_writer(&mut *output, response)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{io::Cursor, sync::Arc};

    use crate::{
        program::{builder::ProgramBuilder, instruction::BinaryOp, types::Type},
        sandbox::{
            child::serve,
            interpreter,
            protocol::{Invocation, InvocationRequest, Outcome, Request, Response},
        },
    };

    fn lines(requests: &[Request]) -> anyhow::Result<String> {
        let mut input = String::new();
        for request in requests {
            input.push_str(&serde_json::to_string(request)?);
            input.push('\n');
        }
        Ok(input)
    }

    fn responses(output: &[u8]) -> anyhow::Result<Vec<Response>> {
        let mut responses = Vec::new();
        for line in std::str::from_utf8(output)?.lines() {
            responses.push(serde_json::from_str(line)?);
        }
        Ok(responses)
    }

    #[test]
    fn answers_every_request_in_order() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Maths");
        builder
            .method(class, "half", &[Type::Int], Type::Int)
            .statik()
            .build(|code| {
                let x = code.parameter(0, Type::Int);
                let result = code.binary(BinaryOp::Div, x, 2, Type::Int);
                code.ret_value(result);
            });
        let program = Arc::new(builder.finish());
        let invoke = |id, method: &str| {
            Request::Invoke(InvocationRequest {
                id,
                invocation: Invocation {
                    method:     method.to_string(),
                    receiver:   None,
                    arguments:  vec![crate::program::types::ConcreteValue::Int(9)],
                    statics:    vec![],
                    timeout_ms: 1_000,
                    replay:     None,
                },
            })
        };
        let input = lines(&[
            Request::Warmup,
            Request::Load {
                program,
                config: interpreter::Config::default(),
            },
            Request::Warmup,
            invoke(1, "demo.Maths.half(int)"),
            invoke(2, "demo.Maths.missing(int)"),
            Request::Shutdown,
        ])?;

        let mut output = Vec::new();
        let exit = serve(Cursor::new(input), &mut output)?;
        assert_eq!(exit, None);

        let responses = responses(&output)?;
        assert_eq!(responses.len(), 5);
        assert!(matches!(responses[0], Response::Rejected { .. }));
        assert_eq!(responses[1], Response::Loaded);
        assert_eq!(responses[2], Response::WarmedUp);
        let Response::Invoked(invoked) = &responses[3] else {
            panic!("expected an invocation response, found {:?}", responses[3]);
        };
        assert_eq!(invoked.id, 1);
        assert_eq!(invoked.outcome, Outcome::Success {
            value: crate::program::types::ConcreteValue::Int(4),
        });
        assert!(matches!(responses[4], Response::Rejected { .. }));

        Ok(())
    }

    #[test]
    fn exits_without_answering_when_the_program_exits() -> anyhow::Result<()> {
        let mut builder = ProgramBuilder::new();
        let class = builder.class("demo.Quitter");
        builder
            .method(class, "quit", &[], Type::Void)
            .statik()
            .build(|code| code.exit(42));
        let input = lines(&[
            Request::Load {
                program: Arc::new(builder.finish()),
                config:  interpreter::Config::default(),
            },
            Request::Invoke(InvocationRequest {
                id:         1,
                invocation: Invocation {
                    method:     "demo.Quitter.quit()".to_string(),
                    receiver:   None,
                    arguments:  vec![],
                    statics:    vec![],
                    timeout_ms: 1_000,
                    replay:     None,
                },
            }),
        ])?;

        let mut output = Vec::new();
        assert_eq!(serve(Cursor::new(input), &mut output)?, Some(42));
        assert_eq!(responses(&output)?, vec![Response::Loaded]);

        Ok(())
    }
}
