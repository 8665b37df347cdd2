//! DNS 劫持
//!
//! 只处理标准查询，把第一个问题的名字解析成本机地址。应答是最小化的：
//! 不回显 authority/additional 段，也不检查查询类型。

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;

/// 响应标志：标准应答，RD + RA，无错误
const RESPONSE_FLAGS: [u8; 2] = [0x81, 0x80];
/// 指向偏移 12 处问题名的压缩指针
const NAME_POINTER: [u8; 2] = [0xc0, 0x0c];
/// TYPE A, CLASS IN, TTL 60, RDLENGTH 4
const ANSWER_FIXED: [u8; 10] = [0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3c, 0x00, 0x04];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// 报文长度不足
    Truncated(usize),
    /// 标签长度超出报文
    LabelOverrun { offset: usize, len: usize },
    /// 标签长度非法（压缩指针或垃圾数据）
    InvalidLabel { offset: usize, len: u8 },
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::Truncated(len) => write!(f, "datagram truncated ({} bytes)", len),
            DnsError::LabelOverrun { offset, len } => {
                write!(f, "label of {} bytes at offset {} runs past datagram", len, offset)
            }
            DnsError::InvalidLabel { offset, len } => {
                write!(f, "invalid label length {:#04x} at offset {}", len, offset)
            }
        }
    }
}

impl std::error::Error for DnsError {}

#[derive(Debug, Clone)]
pub struct DnsQuery<'a> {
    data: &'a [u8],
    /// 点分域名，每个标签后都带 '.'；非标准查询时为空
    pub domain: String,
    question_end: usize,
}

impl<'a> DnsQuery<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DnsError> {
        if data.len() < HEADER_LEN {
            return Err(DnsError::Truncated(data.len()));
        }

        let mut query = Self {
            data,
            domain: String::new(),
            question_end: HEADER_LEN,
        };

        let opcode = (data[2] >> 3) & 0x0f;
        if opcode != 0 {
            return Ok(query);
        }

        let mut pos = HEADER_LEN;
        loop {
            let len = *data.get(pos).ok_or(DnsError::Truncated(data.len()))? as usize;
            if len == 0 {
                pos += 1;
                break;
            }
            if len > MAX_LABEL_LEN {
                return Err(DnsError::InvalidLabel {
                    offset: pos,
                    len: len as u8,
                });
            }
            let label = data
                .get(pos + 1..pos + 1 + len)
                .ok_or(DnsError::LabelOverrun { offset: pos, len })?;
            query.domain.push_str(&String::from_utf8_lossy(label));
            query.domain.push('.');
            pos += len + 1;
        }

        // QTYPE + QCLASS
        if data.len() < pos + 4 {
            return Err(DnsError::Truncated(data.len()));
        }
        query.question_end = pos + 4;

        Ok(query)
    }

    pub fn transaction_id(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    /// 构造指向 `ip` 的 A 记录应答；域名为空时返回空报文
    pub fn build_answer(&self, ip: Ipv4Addr) -> Vec<u8> {
        if self.domain.is_empty() {
            return Vec::new();
        }

        let question = &self.data[HEADER_LEN..self.question_end];
        let qdcount = &self.data[4..6];

        let mut packet = Vec::with_capacity(HEADER_LEN + question.len() + 16);
        packet.extend_from_slice(&self.data[..2]);
        packet.extend_from_slice(&RESPONSE_FLAGS);
        packet.extend_from_slice(qdcount);
        packet.extend_from_slice(qdcount);
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.extend_from_slice(question);
        packet.extend_from_slice(&NAME_POINTER);
        packet.extend_from_slice(&ANSWER_FIXED);
        packet.extend_from_slice(&ip.octets());
        packet
    }
}
