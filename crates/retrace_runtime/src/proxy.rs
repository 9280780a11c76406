//! Guarded function proxies.
//!
//! A proxy dispatches on the calling thread's state. Only `external` with
//! an active context is intercepted: on record the original runs in
//! `internal` and its outcome is written; on replay the outcome is read
//! back and the original never runs. Every other state calls the original
//! directly.

use crate::context::Mode;
use crate::system::Core;
use retrace_core::{CallError, CallResult, Dispatch, DispatchState, Func, Value, func};
use retrace_log::{RecordingOptions, StreamReader, StreamWriter};
use retrace_patch::Function;
use retrace_replay::DivergenceDetector;
use std::sync::Arc;

/// Proxy for `function`, known to the stream as `qualname`
pub(crate) fn proxy(core: &Arc<Core>, qualname: &str, function: &Arc<Function>) -> Arc<Function> {
    let original = function.body().clone();
    let external = {
        let core = Arc::clone(core);
        let qualname = qualname.to_string();
        let original = original.clone();
        func(move |args| {
            let Some(ctx) = core.active() else {
                return original(args);
            };
            match ctx.mode() {
                Mode::Record { writer, options } => {
                    record(&core, writer, options, &qualname, &original, args)
                }
                Mode::Replay {
                    reader,
                    options,
                    detector,
                    ..
                } => replay(&core, reader, detector, options, &qualname, args),
            }
        })
    };
    let dispatch = Dispatch::new(Arc::clone(&core.state), original).on(DispatchState::External, external);
    Function::new(function.name(), dispatch.into_func())
}

fn record(
    core: &Core,
    writer: &StreamWriter,
    options: &RecordingOptions,
    qualname: &str,
    original: &Func,
    args: &[Value],
) -> CallResult {
    if options.trace_inputs {
        writer.write_call(qualname, args)?;
    }
    if options.stacktraces {
        writer.stacktrace(core.stack_for(qualname));
    }
    let outcome = core.state.scoped(DispatchState::Internal, || original(args));
    tracing::trace!(qualname, ?outcome, "recorded");
    match outcome {
        Ok(value) => {
            writer.write_result(value.clone())?;
            Ok(value)
        }
        Err(CallError::Raised(raised)) => {
            writer.write_error(raised.clone())?;
            Err(raised.into())
        }
        Err(err) => Err(err),
    }
}

fn replay(
    core: &Core,
    reader: &StreamReader,
    detector: &DivergenceDetector,
    options: &RecordingOptions,
    qualname: &str,
    args: &[Value],
) -> CallResult {
    if options.trace_inputs {
        reader.expect_call(qualname, args)?;
    }
    if options.stacktraces {
        if let Some(recorded) = reader.next_stack()? {
            detector.compare_stacks(&recorded, &core.stack_for(qualname));
        }
    }
    let outcome = reader.read_result();
    detector.on_result();
    tracing::trace!(qualname, ?outcome, "replayed");
    outcome
}
