//! 文件内容的分块流式读取。

use axum::body::Bytes;
use futures_util::stream::Stream;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::range::ResolvedRange;

pub const STREAM_CHUNK_SIZE: usize = 8 * 1024;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// 打开文件并定位到区间起点，返回惰性分块流。
///
/// 流最多产生 `range.length` 字节；文件句柄归流所有，流结束、出错或被丢弃时关闭。
pub async fn open(path: &Path, range: &ResolvedRange) -> io::Result<ByteStream> {
    let mut file = File::open(path).await?;
    if range.start > 0 {
        file.seek(SeekFrom::Start(range.start)).await?;
    }
    let reader = file.take(range.length);
    Ok(Box::pin(ReaderStream::with_capacity(
        reader,
        STREAM_CHUNK_SIZE,
    )))
}
