// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for exported buffers. The agent's reporter thread owns
//! its sink exclusively, so sinks are plain blocking writers.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::TcpStream;
use std::path::Path;

use crate::record;

/// Where triggered buffers are shipped: a local buffer-log file, or a
/// collector process speaking the same record stream over TCP.
pub enum BufferSink {
    File(BufWriter<File>),
    Tcp(BufWriter<TcpStream>),
    /// Discards everything; used when tracing is on but no export
    /// destination was configured.
    Null,
}

impl BufferSink {
    pub fn file<P: AsRef<Path>>(path: P) -> io::Result<BufferSink> {
        Ok(BufferSink::File(BufWriter::new(File::create(path)?)))
    }

    pub fn collector(addr: &str) -> io::Result<BufferSink> {
        Ok(BufferSink::Tcp(BufWriter::new(TcpStream::connect(addr)?)))
    }

    pub fn write_record(&mut self, agent: &str, buffer: &[u8]) -> io::Result<()> {
        match self {
            BufferSink::File(w) => record::write_record(w, agent, buffer),
            BufferSink::Tcp(w) => record::write_record(w, agent, buffer),
            BufferSink::Null => Ok(()),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            BufferSink::File(w) => w.flush(),
            BufferSink::Tcp(w) => w.flush(),
            BufferSink::Null => Ok(()),
        }
    }
}
