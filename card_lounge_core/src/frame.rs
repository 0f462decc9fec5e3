//! 帧编解码：`[2 字节大端长度][UTF-8 负载]`。
//!
//! 一次 TCP 读取可能包含零个、一个或多个完整帧，也可能只包含半个帧，
//! 所以解码必须在每次收到数据后循环调用，直到缓冲区中不再有完整帧为止。

use thiserror::Error;

/// 长度前缀的字节数
pub const HEADER_LEN: usize = 2;

/// 2 字节长度前缀所能表示的最大负载长度
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge { len: usize },
    /// `frame_len` 是整帧（含长度前缀）的字节数，调用方据此跳过这一帧
    #[error("frame payload is not valid utf-8 ({frame_len} bytes)")]
    InvalidUtf8 { frame_len: usize },
}

/// 把一条消息编码成带长度前缀的帧
pub fn encode_frame(payload: &str) -> Result<Vec<u8>, FrameError> {
    let bytes = payload.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| FrameError::FrameTooLarge { len: bytes.len() })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// 尝试从缓冲区头部解出一帧。
///
/// - 数据不足（长度前缀不完整，或负载未到齐）时返回 `Ok(None)`
/// - 否则返回解出的字符串以及尚未消费的剩余字节
pub fn decode_frame(buf: &[u8]) -> Result<Option<(String, &[u8])>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let frame_len = HEADER_LEN + len;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let payload = std::str::from_utf8(&buf[HEADER_LEN..frame_len])
        .map_err(|_| FrameError::InvalidUtf8 { frame_len })?;
    Ok(Some((payload.to_string(), &buf[frame_len..])))
}

/// 单个连接的接收缓冲区，跨多次读取保存不完整的帧
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 取出下一帧。负载不是合法 UTF-8 时，这一帧会被丢弃并返回错误，
    /// 后续的帧不受影响。
    pub fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        match decode_frame(&self.buf) {
            Ok(Some((payload, rest))) => {
                let consumed = self.buf.len() - rest.len();
                self.buf.drain(..consumed);
                Ok(Some(payload))
            }
            Ok(None) => Ok(None),
            Err(FrameError::InvalidUtf8 { frame_len }) => {
                self.buf.drain(..frame_len);
                Err(FrameError::InvalidUtf8 { frame_len })
            }
            Err(e) => Err(e),
        }
    }

    /// 缓冲区中尚未组成完整帧的字节数
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
