//! 解析 Range 请求头，得到实际读取的字节区间。

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeStatus {
    /// 200
    FullContent,
    /// 206
    PartialContent,
}

/// 闭区间 `[start, end]`，`length` 为实际字节数（空文件时为 0）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    pub length: u64,
    pub status: RangeStatus,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("range not satisfiable for {total} bytes")]
pub struct RangeNotSatisfiable {
    pub total: u64,
}

impl ResolvedRange {
    fn full(total: u64) -> Self {
        Self {
            start: 0,
            end: total.saturating_sub(1),
            length: total,
            status: RangeStatus::FullContent,
        }
    }
}

/// 根据 Range 头与文件大小计算读取区间。
///
/// 只处理第一个 `bytes=<a>-<b>`；缺失或无法解析时返回完整内容，
/// 起点超出文件末尾或起点大于终点时返回 416。
pub fn resolve(header: Option<&str>, total: u64) -> Result<ResolvedRange, RangeNotSatisfiable> {
    let Some((start, end)) = header.and_then(parse_first_range) else {
        return Ok(ResolvedRange::full(total));
    };
    if total == 0 || start > end || start > total - 1 {
        return Err(RangeNotSatisfiable { total });
    }
    let end = end.min(total - 1);
    Ok(ResolvedRange {
        start,
        end,
        length: end - start + 1,
        status: RangeStatus::PartialContent,
    })
}

fn parse_first_range(value: &str) -> Option<(u64, u64)> {
    let (unit, ranges) = value.split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    let first = ranges.split(',').next()?;
    let (start, end) = first.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}
