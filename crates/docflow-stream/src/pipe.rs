//! Pump a [`ReadStream`] into a [`WriteStream`]

use std::sync::Arc;

use docflow_common::{DocFlowError, Result};
use parking_lot::Mutex;

use crate::streams::{Completion, ReadStream, WriteStream};

/// Copy every item of `source` into `sink`.
///
/// The source is paused whenever the sink reports a full write queue and
/// resumed from the sink's drain handler. When the source ends the sink is
/// ended and `done` receives its outcome; a failure on either side detaches
/// the source and fails `done`. `done` runs exactly once.
pub fn pipe<T: Send + 'static>(
    source: Arc<dyn ReadStream<T>>,
    sink: Arc<dyn WriteStream<T>>,
    done: Completion<()>,
) {
    let done: Arc<Mutex<Option<Completion<()>>>> = Arc::new(Mutex::new(Some(done)));
    let finish = {
        let done = Arc::clone(&done);
        move |result: Result<()>| {
            let done = done.lock().take();
            if let Some(done) = done {
                done(result);
            }
        }
    };
    let finish = Arc::new(finish);

    {
        let src = Arc::clone(&source);
        sink.drain_handler(Some(Arc::new(move || src.resume())));
    }
    {
        let (src, fin) = (Arc::clone(&source), Arc::clone(&finish));
        sink.exception_handler(Some(Arc::new(move |error: DocFlowError| {
            tracing::debug!(error = %error, "Pipe sink failed, detaching source");
            src.handler(None);
            fin(Err(error));
        })));
    }
    {
        let fin = Arc::clone(&finish);
        source.exception_handler(Some(Arc::new(move |error: DocFlowError| fin(Err(error)))));
    }
    {
        let (snk, fin) = (Arc::clone(&sink), Arc::clone(&finish));
        source.end_handler(Some(Arc::new(move || {
            let fin = Arc::clone(&fin);
            snk.end(Box::new(move |result: Result<()>| fin(result)));
        })));
    }

    let (src, snk, fin) = (Arc::clone(&source), Arc::clone(&sink), Arc::clone(&finish));
    source.handler(Some(Arc::new(move |item: T| {
        if let Err(e) = snk.write(item) {
            src.end_handler(None);
            src.handler(None);
            fin(Err(e));
            return;
        }
        if snk.write_queue_full() {
            src.pause();
        }
    })));
}
