//! 分块响应写出
//!
//! 每个 reactor 轮次对每个可写连接只调用一次 [`advance`]，最多发送一个块，
//! 大文件不会饿死其他连接。

use std::io::{self, Write};

use bytes::{Buf, Bytes};

use super::content::ContentSource;

/// 每轮读取/发送的最大字节数
pub const CHUNK_SIZE: usize = 4096;

/// 一个连接上待写出的响应
pub struct WriteTask {
    /// 尚未发出的头部
    header: Bytes,
    source: Option<Box<dyn ContentSource>>,
    offset: u64,
}

impl WriteTask {
    pub fn new(header: Bytes, source: Option<Box<dyn ContentSource>>) -> Self {
        Self {
            header,
            source,
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }
}

impl std::fmt::Debug for WriteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTask")
            .field("header", &format_args!("[{} bytes]", self.header.len()))
            .field("source", &self.source.as_ref().map(|s| s.size()))
            .field("offset", &self.offset)
            .finish()
    }
}

/// 一次 [`advance`] 的结果；`next` 为 None 表示响应已写完
#[derive(Debug)]
pub struct Step {
    pub sent: usize,
    pub next: Option<WriteTask>,
}

fn send<W: Write>(sink: &mut W, data: &[u8]) -> io::Result<usize> {
    match sink.write(data) {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// 向 `sink` 推进一步
pub fn advance<W: Write>(mut task: WriteTask, sink: &mut W) -> io::Result<Step> {
    let mut sent = 0;

    if task.header.has_remaining() {
        let n = send(sink, &task.header)?;
        task.header.advance(n);
        sent += n;

        if task.header.has_remaining() {
            return Ok(Step {
                sent,
                next: Some(task),
            });
        }
    }

    let Some(source) = task.source.as_mut() else {
        return Ok(Step { sent, next: None });
    };

    let remaining = source.size().saturating_sub(task.offset);
    if remaining == 0 {
        return Ok(Step { sent, next: None });
    }

    let mut chunk = [0u8; CHUNK_SIZE];
    let read = source.read_at(task.offset, &mut chunk)?;
    let written = send(sink, &chunk[..read])?;
    sent += written;

    if written < read {
        // 没写完的部分下一轮重新读
        task.offset += written as u64;
        return Ok(Step {
            sent,
            next: Some(task),
        });
    }

    if read == CHUNK_SIZE && (read as u64) < remaining {
        task.offset += CHUNK_SIZE as u64;
        Ok(Step {
            sent,
            next: Some(task),
        })
    } else {
        task.offset = 0;
        Ok(Step { sent, next: None })
    }
}
