//! Trace loading: record parsing, atomic store splitting and transaction
//! ranges.
//!
//! Record formats, one per line:
//!
//! ```text
//! Store,<tid>,<addr hex>,<size>,<b0 b1 .. hex bytes>,<src>
//! Flush,<tid>,<addr hex>,<src>
//! Fence,<tid>,<src>
//! TXStart,<tid>,<src>
//! TXEnd,<tid>,<src>
//! TXAdd,<tid>,<addr hex>,<size>,<src>
//! TXAlloc,<tid>,<addr hex>,<size>,<src>
//! <library call>,<tid>,<src>[,<phase>]
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use pmcheck_error::{PmcheckError, Result};
use tracing::{debug, info};

use crate::op::{OpKind, Operation, SourceTag};
use crate::range::{ATOMIC_WRITE_BYTES, AddrRange, CACHELINE_BYTES, cacheline_address};
use crate::{OpId, ThreadId};

/// Inclusive id span of one `TxStart`..`TxEnd` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxRange {
    pub start: OpId,
    pub end: OpId,
}

impl TxRange {
    pub const fn contains(&self, id: OpId) -> bool {
        self.start.get() <= id.get() && id.get() <= self.end.get()
    }

    /// Number of ops in the span, markers included.
    pub const fn len(&self) -> u64 {
        self.end.get() - self.start.get() + 1
    }

    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// An immutable, parsed trace.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    ops: Vec<Operation>,
    tx_ranges: Vec<TxRange>,
}

impl Trace {
    /// Load and parse a trace file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let trace = Self::parse(&text)?;
        info!(
            path = %path.display(),
            ops = trace.ops.len(),
            transactions = trace.tx_ranges.len(),
            "trace loaded"
        );
        Ok(trace)
    }

    /// Parse trace text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = RecordParser::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            parser.record(idx + 1, line)?;
        }
        Self::from_operations(parser.ops)
    }

    /// Build a trace from already split operations.
    ///
    /// Ids must be dense from 0 and transaction markers must pair up
    /// without nesting.
    pub fn from_operations(ops: Vec<Operation>) -> Result<Self> {
        let mut tx_ranges = Vec::new();
        let mut open: Option<OpId> = None;
        for (idx, op) in ops.iter().enumerate() {
            if op.id.index() != idx {
                return Err(PmcheckError::internal(format!(
                    "op ids are not dense: found {} at position {idx}",
                    op.id
                )));
            }
            match op.kind {
                OpKind::TxStart => {
                    if let Some(start) = open {
                        return Err(PmcheckError::UnbalancedNesting {
                            op: op.id.get(),
                            detail: format!("TXStart inside transaction opened at {start}"),
                        });
                    }
                    open = Some(op.id);
                }
                OpKind::TxEnd => {
                    let Some(start) = open.take() else {
                        return Err(PmcheckError::UnbalancedNesting {
                            op: op.id.get(),
                            detail: "TXEnd without TXStart".to_owned(),
                        });
                    };
                    tx_ranges.push(TxRange { start, end: op.id });
                }
                _ => {}
            }
        }
        if let Some(start) = open {
            return Err(PmcheckError::UnbalancedNesting {
                op: start.get(),
                detail: "TXStart never closed".to_owned(),
            });
        }
        Ok(Self { ops, tx_ranges })
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Look up an op by id.
    pub fn op(&self, id: OpId) -> Result<&Operation> {
        self.ops
            .get(id.index())
            .ok_or(PmcheckError::UnknownOp { op: id.get() })
    }

    pub fn tx_ranges(&self) -> &[TxRange] {
        &self.tx_ranges
    }

    pub fn tx_count(&self) -> usize {
        self.tx_ranges.len()
    }

    pub fn tx(&self, tx: usize) -> Result<TxRange> {
        self.tx_ranges
            .get(tx)
            .copied()
            .ok_or_else(|| PmcheckError::internal(format!("no transaction {tx}")))
    }

    /// Stores in `[start, end]` of transaction `tx`, in id order.
    pub fn tx_stores(&self, tx: usize) -> Result<Vec<&Operation>> {
        let range = self.tx(tx)?;
        Ok(self.ops[range.start.index()..=range.end.index()]
            .iter()
            .filter(|op| op.is_store())
            .collect())
    }

    /// Ops strictly between the transaction's markers.
    pub fn tx_interior(&self, tx: usize) -> Result<&[Operation]> {
        let range = self.tx(tx)?;
        Ok(&self.ops[range.start.index() + 1..range.end.index()])
    }

    /// Ops in `[from, to)`, clamped to the trace.
    pub fn ops_between(&self, from: usize, to: usize) -> &[Operation] {
        let to = to.min(self.ops.len());
        let from = from.min(to);
        &self.ops[from..to]
    }

    /// Transaction whose span contains `id`.
    pub fn tx_containing(&self, id: OpId) -> Option<usize> {
        let idx = self.tx_ranges.partition_point(|r| r.end < id);
        self.tx_ranges
            .get(idx)
            .filter(|r| r.contains(id))
            .map(|_| idx)
    }

    /// Total stores inside transactions.
    pub fn store_count_in_transactions(&self) -> usize {
        self.tx_ranges
            .iter()
            .map(|r| {
                self.ops[r.start.index()..=r.end.index()]
                    .iter()
                    .filter(|op| op.is_store())
                    .count()
            })
            .sum()
    }

    /// Write the atomic-granularity trace, one op per line.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let mut out = std::io::BufWriter::new(fs::File::create(path)?);
        for op in &self.ops {
            writeln!(out, "{op}")?;
        }
        out.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordParser {
    ops: Vec<Operation>,
}

impl RecordParser {
    fn next_id(&self) -> OpId {
        OpId::new(self.ops.len() as u64)
    }

    fn push(&mut self, tid: ThreadId, src: &str, kind: OpKind) {
        let id = self.next_id();
        self.ops.push(Operation {
            id,
            tid,
            src: SourceTag::new(src),
            kind,
        });
    }

    fn record(&mut self, line: usize, text: &str) -> Result<()> {
        let tag = text.split(',').next().unwrap_or_default();
        match tag {
            "Store" => self.store(line, text),
            "Flush" => {
                let f = fields(line, text, 4)?;
                let tid = parse_tid(line, f[1])?;
                let address = cacheline_address(parse_hex(line, f[2], "address")?);
                self.push(
                    tid,
                    f[3],
                    OpKind::Flush {
                        range: AddrRange::new(address, CACHELINE_BYTES),
                    },
                );
                Ok(())
            }
            "Fence" | "TXStart" | "TXEnd" => {
                let f = fields(line, text, 3)?;
                let tid = parse_tid(line, f[1])?;
                let kind = match tag {
                    "Fence" => OpKind::Fence,
                    "TXStart" => OpKind::TxStart,
                    _ => OpKind::TxEnd,
                };
                self.push(tid, f[2], kind);
                Ok(())
            }
            "TXAdd" | "TXAlloc" => {
                let f = fields(line, text, 5)?;
                let tid = parse_tid(line, f[1])?;
                let range = AddrRange::new(
                    parse_hex(line, f[2], "address")?,
                    parse_dec(line, f[3], "size")?,
                );
                let kind = if tag == "TXAdd" {
                    OpKind::LibRangeAdd { range }
                } else {
                    OpKind::LibRangeAlloc { range }
                };
                self.push(tid, f[4], kind);
                Ok(())
            }
            "" => Err(PmcheckError::trace(line, "empty record tag")),
            name => {
                let parts: Vec<&str> = text.splitn(4, ',').collect();
                if parts.len() < 3 {
                    return Err(PmcheckError::trace(
                        line,
                        format!("library call '{name}' needs tid and source fields"),
                    ));
                }
                let tid = parse_tid(line, parts[1])?;
                let phase = parts.get(3).map(|p| (*p).to_owned());
                self.push(
                    tid,
                    parts[2],
                    OpKind::LibCall {
                        name: name.to_owned(),
                        phase,
                    },
                );
                Ok(())
            }
        }
    }

    /// Split one traced store into atomic-write chunks: an unaligned head up
    /// to the next boundary, whole chunks, then a tail.
    fn store(&mut self, line: usize, text: &str) -> Result<()> {
        let f = fields(line, text, 6)?;
        let tid = parse_tid(line, f[1])?;
        let address = parse_hex(line, f[2], "address")?;
        let size = parse_dec(line, f[3], "size")?;
        let bytes = parse_bytes(line, f[4])?;
        if bytes.len() as u64 != size {
            return Err(PmcheckError::trace(
                line,
                format!("store size {size} but {} value bytes", bytes.len()),
            ));
        }
        if size == 0 {
            debug!(line, address = format_args!("{address:#x}"), "zero-size store dropped");
            return Ok(());
        }

        let mut offset = 0u64;
        while offset < size {
            let chunk_address = address + offset;
            let boundary = (chunk_address / ATOMIC_WRITE_BYTES + 1) * ATOMIC_WRITE_BYTES;
            let chunk = (boundary - chunk_address).min(size - offset);
            #[allow(clippy::cast_possible_truncation)]
            let slice = bytes[offset as usize..(offset + chunk) as usize].to_vec();
            self.push(
                tid,
                f[5],
                OpKind::Store {
                    range: AddrRange::new(chunk_address, chunk),
                    bytes: slice,
                },
            );
            offset += chunk;
        }
        Ok(())
    }
}

/// Split into exactly `n` fields; the last keeps any further commas.
fn fields<'a>(line: usize, text: &'a str, n: usize) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = text.splitn(n, ',').collect();
    if parts.len() != n {
        return Err(PmcheckError::trace(
            line,
            format!("expected {n} fields, found {}", parts.len()),
        ));
    }
    Ok(parts)
}

fn parse_tid(line: usize, field: &str) -> Result<ThreadId> {
    field
        .trim()
        .parse::<u32>()
        .map(ThreadId::new)
        .map_err(|e| PmcheckError::trace(line, format!("bad thread id '{field}': {e}")))
}

fn parse_hex(line: usize, field: &str, what: &str) -> Result<u64> {
    let digits = field.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u64::from_str_radix(digits, 16)
        .map_err(|e| PmcheckError::trace(line, format!("bad {what} '{field}': {e}")))
}

fn parse_dec(line: usize, field: &str, what: &str) -> Result<u64> {
    field
        .trim()
        .parse::<u64>()
        .map_err(|e| PmcheckError::trace(line, format!("bad {what} '{field}': {e}")))
}

fn parse_bytes(line: usize, field: &str) -> Result<Vec<u8>> {
    field
        .trim()
        .trim_matches('"')
        .split_whitespace()
        .map(|b| {
            u8::from_str_radix(b, 16)
                .map_err(|e| PmcheckError::trace(line, format!("bad value byte '{b}': {e}")))
        })
        .collect()
}
