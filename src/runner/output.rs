//! Child output handling
//!
//! The program host feeds raw output chunks to an [`OutputParser`] and to
//! the [`OutputLogger`]. [`LineBuffered`] reassembles chunks into lines for
//! handlers that work line-wise, such as the web UI sniffer.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use regex::Regex;
use tracing::warn;

/// Receives raw output chunks from the running program.
pub trait OutputParser: Send {
    /// Consume one chunk, exactly as it came off the pipe.
    fn parse(&mut self, chunk: &[u8]);

    /// The program has exited; emit anything still buffered.
    fn flush(&mut self);
}

/// Receives complete output lines, without the trailing newline.
pub trait LineHandler: Send {
    fn handle_line(&mut self, line: &[u8]);
}

/// Reassembles arbitrary chunks into `\n`-terminated lines.
///
/// A partial line is held until its newline arrives; `flush` emits any
/// unterminated tail.
pub struct LineBuffered<H: LineHandler> {
    buf: Vec<u8>,
    handler: H,
}

impl<H: LineHandler> LineBuffered<H> {
    pub fn new(handler: H) -> Self {
        Self {
            buf: Vec::new(),
            handler,
        }
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: LineHandler> OutputParser for LineBuffered<H> {
    fn parse(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            self.buf.pop(); // the newline
            let line = std::mem::replace(&mut self.buf, rest);
            self.handler.handle_line(&line);
        }
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.handler.handle_line(&line);
        }
    }
}

/// Detects served web UIs in program output.
///
/// Matches announcements of the form `TensorBoard 2.15.1 at
/// http://localhost:6006/` and reports `(name, uri)` pairs so the runner
/// can publish them on the experiment document.
pub struct WebUiHandler<F: FnMut(&str, &str) + Send> {
    pattern: Regex,
    callback: F,
}

impl<F: FnMut(&str, &str) + Send> WebUiHandler<F> {
    pub fn new(callback: F) -> Self {
        // Pattern syntax is fixed at compile time.
        let pattern = Regex::new(
            r"(?i)\b(TensorBoard(?:\s+[0-9][\w.]*)?)\s+(?:at|on)\s+(https?://[^\s,;]+)",
        )
        .unwrap_or_else(|e| {
            warn!("web UI pattern failed to compile: {e}");
            Regex::new("$^").expect("trivial pattern")
        });
        Self { pattern, callback }
    }
}

impl<F: FnMut(&str, &str) + Send> LineHandler for WebUiHandler<F> {
    fn handle_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if let Some(caps) = self.pattern.captures(&text) {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("WebUI");
            if let Some(uri) = caps.get(2) {
                (self.callback)(name, uri.as_str().trim_end_matches('/'));
            }
        }
    }
}

/// Tees program output to a capture file and, optionally, our own stdout.
pub struct OutputLogger {
    file: Option<File>,
    to_stdout: bool,
}

impl OutputLogger {
    /// Open the capture file. `append` keeps existing content, which is how
    /// resumed runs accumulate one continuous log.
    pub fn open(log_file: Option<&Path>, append: bool, to_stdout: bool) -> io::Result<Self> {
        let file = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(path)?;
                Some(file)
            }
            None => None,
        };
        Ok(Self { file, to_stdout })
    }

    /// Write one chunk everywhere it goes. Write failures are reported but
    /// never interrupt the program.
    pub fn write(&mut self, chunk: &[u8]) {
        if let Some(file) = &mut self.file {
            if let Err(e) = file.write_all(chunk) {
                warn!("failed to write program log: {e}");
            }
        }
        if self.to_stdout {
            let mut stdout = io::stdout().lock();
            if stdout.write_all(chunk).and_then(|()| stdout.flush()).is_err() {
                // Parent stdout is gone; keep the file capture going.
                self.to_stdout = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<Vec<u8>>);

    impl LineHandler for Collect {
        fn handle_line(&mut self, line: &[u8]) {
            self.0.push(line.to_vec());
        }
    }

    #[test]
    fn chunks_reassemble_into_lines() {
        let mut parser = LineBuffered::new(Collect(Vec::new()));

        parser.parse(b"");
        parser.parse(b"no line break ");
        parser.parse(b"until ");
        parser.parse(b"");
        parser.parse(b"this word\nanother line\nthen the third ");
        parser.parse(b"line");

        assert_eq!(
            parser.handler_mut().0,
            vec![
                b"no line break until this word".to_vec(),
                b"another line".to_vec(),
            ]
        );

        parser.flush();
        assert_eq!(
            parser.handler_mut().0,
            vec![
                b"no line break until this word".to_vec(),
                b"another line".to_vec(),
                b"then the third line".to_vec(),
            ]
        );

        parser.parse(b"");
        parser.parse(b"the fourth line\n");
        parser.parse(b"the fifth line\n");
        parser.flush();
        assert_eq!(parser.handler_mut().0.len(), 5);
        assert_eq!(parser.handler_mut().0[3], b"the fourth line".to_vec());
        assert_eq!(parser.handler_mut().0[4], b"the fifth line".to_vec());
    }

    #[test]
    fn flush_with_empty_buffer_emits_nothing() {
        let mut parser = LineBuffered::new(Collect(Vec::new()));
        parser.flush();
        parser.parse(b"done\n");
        parser.flush();
        assert_eq!(parser.handler_mut().0, vec![b"done".to_vec()]);
    }

    #[test]
    fn tensorboard_announcements_are_detected() {
        let mut seen = Vec::new();
        {
            let mut parser = LineBuffered::new(WebUiHandler::new(|name: &str, uri: &str| {
                seen.push((name.to_string(), uri.to_string()));
            }));
            parser.parse(b"TensorBoard 2.15.1 at http://localhost:6006/ (Press CTRL+C to quit)\n");
            parser.parse(b"epoch 1: loss=0.52\n");
            parser.flush();
        }
        assert_eq!(
            seen,
            vec![("TensorBoard 2.15.1".to_string(), "http://localhost:6006".to_string())]
        );
    }

    #[test]
    fn ordinary_urls_are_not_web_uis() {
        let mut count = 0usize;
        {
            let mut parser = LineBuffered::new(WebUiHandler::new(|_: &str, _: &str| count += 1));
            parser.parse(b"downloading from http://example.com/data.zip\n");
            parser.flush();
        }
        assert_eq!(count, 0);
    }
}
