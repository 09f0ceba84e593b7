use std::io::ErrorKind;
use std::process::Stdio;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::worker::Worker;

/// CommandWorker runs `program` once per bundle. The records of the bundle are written to its
/// stdin, one per line, and every line it prints on stdout becomes an output record. A record must
/// not contain a newline, it would reach the command as several lines.
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    bundle: Vec<Bytes>,
    opened: bool,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            bundle: Vec::new(),
            opened: false,
        }
    }

    /// Parses a whitespace separated command line, e.g. `tr a-z A-Z`.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("worker command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }

    fn encode_bundle(bundle: &[Bytes]) -> Bytes {
        let size = bundle.iter().map(|r| r.len() + 1).sum();
        let mut buf = BytesMut::with_capacity(size);
        for record in bundle {
            buf.put_slice(record);
            buf.put_u8(b'\n');
        }
        buf.freeze()
    }

    fn decode_output(stdout: Vec<u8>) -> Vec<Bytes> {
        let stdout = Bytes::from(stdout);
        stdout
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| stdout.slice_ref(line))
            .collect()
    }
}

impl Worker for CommandWorker {
    type Input = Bytes;
    type Output = Bytes;

    async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(Error::Worker("worker is already open".to_string()));
        }
        info!(program = %self.program, args = ?self.args, "Opening command worker");
        self.opened = true;
        Ok(())
    }

    async fn process(&mut self, record: Bytes) -> Result<()> {
        if !self.opened {
            return Err(Error::Worker("worker is not open".to_string()));
        }
        if record.contains(&b'\n') {
            return Err(Error::Worker(
                "record contains a newline, the command reads one record per line".to_string(),
            ));
        }
        self.bundle.push(record);
        Ok(())
    }

    async fn finalize_bundle(&mut self) -> Result<Vec<Bytes>> {
        if self.bundle.is_empty() {
            return Ok(vec![]);
        }

        let input = Self::encode_bundle(&std::mem::take(&mut self.bundle));
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Worker(format!("failed to spawn {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("stdin of the worker is not piped".to_string()))?;

        // stdin is written from a separate task so a command that fills its stdout pipe before
        // reading all of its input cannot deadlock us.
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;

        match writer.await {
            Ok(Ok(())) => {}
            // the command is free to exit without reading its input
            Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "Worker exited before reading the whole bundle");
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(Error::Worker(format!("stdin writer task failed: {e}"))),
        }

        if !output.status.success() {
            return Err(Error::Worker(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(Self::decode_output(output.stdout))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.bundle.is_empty() {
            warn!(
                dropped = self.bundle.len(),
                "Closing command worker with records that were never finalized"
            );
            self.bundle.clear();
        }
        self.opened = false;
        Ok(())
    }
}
