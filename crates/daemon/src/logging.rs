//! Log output setup
//!
//! Every formatted record passes through [`RedactingWriter`] so secrets that
//! slip into a message never reach the terminal.

use std::io::{self, Write};

use qaflow_common::scrub_text;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(RedactingMakeWriter::stderr()))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(RedactingMakeWriter::stderr()))
            .init();
    }
}

/// Hands out a [`RedactingWriter`] per log record
#[derive(Clone, Copy)]
pub struct RedactingMakeWriter<F> {
    make: F,
}

impl RedactingMakeWriter<fn() -> io::Stderr> {
    pub fn stderr() -> Self {
        Self { make: io::stderr }
    }
}

impl<F, W> RedactingMakeWriter<F>
where
    F: Fn() -> W,
    W: Write,
{
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

impl<'a, F, W> MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'a,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make)())
    }
}

/// Buffers one record and scrubs it on flush or drop
pub struct RedactingWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf);
        let scrubbed = scrub_text(&text);
        self.buf.clear();
        self.inner.write_all(scrubbed.as_bytes())?;
        self.inner.flush()
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_writer_scrubs_on_drop() {
        let sink = Sink::default();
        {
            let mut writer = RedactingWriter::new(sink.clone());
            write!(writer, "calling api with Authorization: Bearer ").unwrap();
            writeln!(writer, "abc.def.ghi").unwrap();
        }
        let text = sink.text();
        assert!(!text.contains("abc.def.ghi"), "{}", text);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_subscriber_output_is_scrubbed() {
        let sink = Sink::default();
        let make = {
            let sink = sink.clone();
            RedactingMakeWriter::new(move || sink.clone())
        };
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(make));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("login with password=hunter2 for qa");
        });

        let text = sink.text();
        assert!(text.contains("login with"));
        assert!(!text.contains("hunter2"), "{}", text);
    }
}
