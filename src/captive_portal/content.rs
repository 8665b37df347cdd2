//! 静态内容来源
//!
//! reactor 只需要两件事：路径是否存在，以及按偏移读取定长块。

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

/// 可按偏移分块读取的响应体
pub trait ContentSource {
    /// 总字节数
    fn size(&self) -> u64;

    /// 从 `offset` 开始尽量填满 `buf`，返回读到的字节数；到达末尾时可能少于 `buf.len()`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ContentSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl ContentSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// 文件系统接口
pub trait WebRoot {
    /// `path` 是请求中的绝对路径，例如 `/index.html`
    fn exists(&self, path: &str) -> bool;

    fn open(&self, path: &str) -> io::Result<Box<dyn ContentSource>>;
}

/// 以磁盘目录为根
#[derive(Debug, Clone)]
pub struct DiskRoot {
    base: PathBuf,
}

impl DiskRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// 拼出磁盘路径；含 `..` 等跳出根目录的成分时返回 None
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.base.join(relative))
    }
}

impl WebRoot for DiskRoot {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_some_and(|p| p.is_file())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn ContentSource>> {
        let full = self
            .resolve(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path escapes web root"))?;
        Ok(Box::new(FileSource::open(&full)?))
    }
}
