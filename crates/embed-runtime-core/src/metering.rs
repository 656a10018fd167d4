//! Deterministic gas metering.
//!
//! A metered module is rewritten before compilation so that it keeps its
//! own account of consumed points:
//!
//! - Two globals are appended: the points used so far (mutable, exported as
//!   [`POINTS_USED_EXPORT`]) and the gas limit (immutable).
//! - Every function body is split into straight-line segments. A segment
//!   ends after any instruction that can transfer control (blocks, branches,
//!   calls, returns, `end`). Each segment is prefixed with a charge that adds
//!   the summed [`OpcodeCosts`] of its instructions to the points global and
//!   executes `unreachable` once the total exceeds the limit. A charge that
//!   would overflow the counter saturates it at `u64::MAX` and traps.
//!
//! Control can only enter a segment at its first instruction, so every
//! executed instruction is paid for before it runs.
//!
//! # Opcode indices
//!
//! The cost table has [`OPCODE_COUNT`] entries. Single-byte opcodes
//! (`0x00..=0xFA`) use their byte value as index; `0xFC`-prefixed opcodes
//! use `0xFC + sub_opcode`. Other prefixes (GC, SIMD, threads) have no slot
//! and are rejected.

use std::fmt;
use std::ops::Range;

use tracing::debug;
use wasm_encoder::{CodeSection, Encode, RawSection};
use wasmparser::{BinaryReader, Encoding, FunctionBody, Operator, Parser, Payload, TypeRef};

use embed_runtime_common::{MeteringConfig, MeteringError};

/// Number of opcodes with a slot in the cost table.
pub const OPCODE_COUNT: usize = 410;

/// Export name of the injected points-used global.
pub const POINTS_USED_EXPORT: &str = "__embed_points_used";

const PREFIX_MISC: u8 = 0xFC;
const FIRST_UNMETERED_PREFIX: u8 = 0xFB;

const SECTION_IMPORT: u8 = 2;
const SECTION_GLOBAL: u8 = 6;
const SECTION_EXPORT: u8 = 7;
const SECTION_CODE: u8 = 10;

const GLOBAL_RANK: u8 = section_rank(SECTION_GLOBAL);
const EXPORT_RANK: u8 = section_rank(SECTION_EXPORT);
const END_RANK: u8 = u8::MAX;

/// Per-opcode execution costs, indexed as described in the module docs.
#[derive(Clone, PartialEq, Eq)]
pub struct OpcodeCosts {
    costs: Box<[u32; OPCODE_COUNT]>,
}

impl OpcodeCosts {
    /// Every opcode costs `cost` points.
    pub fn uniform(cost: u32) -> Self {
        Self {
            costs: Box::new([cost; OPCODE_COUNT]),
        }
    }

    /// Every opcode is free.
    pub fn zero() -> Self {
        Self::uniform(0)
    }

    /// Build a table from a caller-supplied slice.
    ///
    /// # Errors
    ///
    /// Fails unless the slice has exactly [`OPCODE_COUNT`] entries.
    pub fn from_slice(costs: &[u32]) -> Result<Self, MeteringError> {
        let costs: [u32; OPCODE_COUNT] =
            costs
                .try_into()
                .map_err(|_| MeteringError::CostTableLength {
                    expected: OPCODE_COUNT,
                    given: costs.len(),
                })?;

        Ok(Self {
            costs: Box::new(costs),
        })
    }

    /// Build a table from configuration: `default_cost` everywhere, then
    /// each override in order.
    pub fn from_config(config: &MeteringConfig) -> Result<Self, MeteringError> {
        let mut costs = Self::uniform(config.default_cost);
        for entry in &config.overrides {
            costs.set(usize::from(entry.opcode), entry.cost)?;
        }
        Ok(costs)
    }

    /// Cost of the opcode at `index`, if the index is in range.
    pub fn get(&self, index: usize) -> Option<u32> {
        self.costs.get(index).copied()
    }

    /// Set the cost of the opcode at `index`.
    pub fn set(&mut self, index: usize, cost: u32) -> Result<(), MeteringError> {
        let slot = self
            .costs
            .get_mut(index)
            .ok_or(MeteringError::OpcodeOutOfRange {
                index,
                count: OPCODE_COUNT,
            })?;
        *slot = cost;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.costs[..]
    }
}

impl Default for OpcodeCosts {
    fn default() -> Self {
        Self::uniform(1)
    }
}

impl fmt::Debug for OpcodeCosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let non_zero = self.costs.iter().filter(|cost| **cost != 0).count();
        let max = self.costs.iter().max().copied().unwrap_or(0);
        f.debug_struct("OpcodeCosts")
            .field("non_zero", &non_zero)
            .field("max", &max)
            .finish_non_exhaustive()
    }
}

/// Rewrite `bytes` so that execution is charged against `gas_limit`.
///
/// # Errors
///
/// Fails if the bytes are not a core module or use an opcode without a
/// cost table slot.
pub fn inject_gas_metering(
    bytes: &[u8],
    gas_limit: u64,
    costs: &OpcodeCosts,
) -> Result<Vec<u8>, MeteringError> {
    let mut injector = GasInjector::new(bytes, gas_limit, costs);

    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(MeteringError::malformed)?;
        injector.payload(payload)?;
    }

    debug!(
        original_len = bytes.len(),
        gas_limit,
        points_global = injector.points_global,
        "Gas metering injected"
    );

    Ok(injector.module.finish())
}

/// Cost table index of the instruction starting at `offset`.
pub fn opcode_index(bytes: &[u8], offset: usize) -> Result<usize, MeteringError> {
    let code = bytes
        .get(offset..)
        .ok_or_else(|| MeteringError::malformed(format!("truncated code at offset {offset}")))?;
    let mut reader = BinaryReader::new(code, offset);
    let opcode = reader.read_u8().map_err(MeteringError::malformed)?;

    match opcode {
        PREFIX_MISC => {
            let sub = reader.read_var_u32().map_err(MeteringError::malformed)?;
            let index = usize::from(PREFIX_MISC) + sub as usize;
            if index < OPCODE_COUNT {
                Ok(index)
            } else {
                Err(MeteringError::UnsupportedOpcode { opcode, offset })
            }
        }
        FIRST_UNMETERED_PREFIX.. => Err(MeteringError::UnsupportedOpcode { opcode, offset }),
        _ => Ok(usize::from(opcode)),
    }
}

/// Returns `true` if control may leave or enter the code right after `op`.
fn ends_segment(op: &Operator<'_>) -> bool {
    matches!(
        op,
        Operator::Unreachable
            | Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::If { .. }
            | Operator::Else
            | Operator::End
            | Operator::Br { .. }
            | Operator::BrIf { .. }
            | Operator::BrTable { .. }
            | Operator::BrOnNull { .. }
            | Operator::BrOnNonNull { .. }
            | Operator::Return
            | Operator::Call { .. }
            | Operator::CallIndirect { .. }
            | Operator::CallRef { .. }
            | Operator::ReturnCall { .. }
            | Operator::ReturnCallIndirect { .. }
            | Operator::ReturnCallRef { .. }
            | Operator::Try { .. }
            | Operator::TryTable { .. }
            | Operator::Catch { .. }
            | Operator::CatchAll
            | Operator::Delegate { .. }
            | Operator::Throw { .. }
            | Operator::ThrowRef
            | Operator::Rethrow { .. }
    )
}

/// Section order rank; custom sections (id 0) are unordered.
const fn section_rank(id: u8) -> u8 {
    match id {
        1..=5 => id,
        13 => 6, // tag
        6 => 7,
        7 => 8,
        8 => 9,
        9 => 10,
        12 => 11, // data count
        10 => 12,
        11 => 13,
        _ => 0,
    }
}

struct GasInjector<'a> {
    bytes: &'a [u8],
    gas_limit: u64,
    costs: &'a OpcodeCosts,
    module: wasm_encoder::Module,
    imported_globals: u32,
    points_global: u32,
    globals_emitted: bool,
    exports_emitted: bool,
    code: Option<CodeSection>,
    pending_bodies: u32,
}

impl<'a> GasInjector<'a> {
    fn new(bytes: &'a [u8], gas_limit: u64, costs: &'a OpcodeCosts) -> Self {
        Self {
            bytes,
            gas_limit,
            costs,
            module: wasm_encoder::Module::new(),
            imported_globals: 0,
            points_global: 0,
            globals_emitted: false,
            exports_emitted: false,
            code: None,
            pending_bodies: 0,
        }
    }

    fn payload(&mut self, payload: Payload<'a>) -> Result<(), MeteringError> {
        match payload {
            Payload::Version { encoding, .. } => {
                if encoding != Encoding::Module {
                    return Err(MeteringError::malformed(
                        "components cannot be metered; expected a core module",
                    ));
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader.clone() {
                    let import = import.map_err(MeteringError::malformed)?;
                    if matches!(import.ty, TypeRef::Global(_)) {
                        self.imported_globals += 1;
                    }
                }
                self.copy_section(SECTION_IMPORT, reader.range());
            }
            Payload::GlobalSection(reader) => {
                self.before(SECTION_GLOBAL);
                self.emit_globals(reader.count(), reader.range());
            }
            Payload::ExportSection(reader) => {
                self.before(SECTION_EXPORT);
                self.emit_exports(reader.count(), reader.range());
            }
            Payload::CodeSectionStart { count, .. } => {
                self.before(SECTION_CODE);
                self.pending_bodies = count;
                let code = CodeSection::new();
                if count == 0 {
                    self.module.section(&code);
                } else {
                    self.code = Some(code);
                }
            }
            Payload::CodeSectionEntry(body) => {
                let instrumented = self.instrument_body(&body)?;
                if let Some(code) = self.code.as_mut() {
                    code.raw(&instrumented);
                }
                self.pending_bodies = self.pending_bodies.saturating_sub(1);
                if self.pending_bodies == 0 {
                    if let Some(code) = self.code.take() {
                        self.module.section(&code);
                    }
                }
            }
            Payload::End(_) => self.before_rank(END_RANK),
            other => {
                if let Some((id, range)) = other.as_section() {
                    self.copy_section(id, range);
                }
            }
        }
        Ok(())
    }

    fn copy_section(&mut self, id: u8, range: Range<usize>) {
        if id != 0 {
            self.before(id);
        }
        self.module.section(&RawSection {
            id,
            data: &self.bytes[range],
        });
    }

    /// Emit the injected global/export sections if a later section is next.
    fn before(&mut self, id: u8) {
        self.before_rank(section_rank(id));
    }

    fn before_rank(&mut self, rank: u8) {
        if !self.globals_emitted && rank > GLOBAL_RANK {
            self.emit_globals(0, 0..0);
        }
        if !self.exports_emitted && rank > EXPORT_RANK {
            self.emit_exports(0, 0..0);
        }
    }

    /// Existing entries of a vector section, without the leading count.
    fn entries(&self, count: u32, range: Range<usize>) -> &'a [u8] {
        if count == 0 {
            return &[];
        }
        let bytes = self.bytes;
        let section = &bytes[range.clone()];
        let mut reader = BinaryReader::new(section, range.start);
        match reader.read_var_u32() {
            Ok(_) => &section[reader.current_position()..],
            Err(_) => &[],
        }
    }

    fn emit_globals(&mut self, count: u32, range: Range<usize>) {
        let entries = self.entries(count, range);
        self.points_global = self.imported_globals + count;

        let mut data = Vec::with_capacity(entries.len() + 24);
        (count + 2).encode(&mut data);
        data.extend_from_slice(entries);

        // points used: mut i64 = 0
        data.extend_from_slice(&[0x7E, 0x01, 0x42, 0x00, 0x0B]);

        // gas limit: i64 = limit (bit pattern, compared unsigned)
        data.extend_from_slice(&[0x7E, 0x00, 0x42]);
        i64::from_ne_bytes(self.gas_limit.to_ne_bytes()).encode(&mut data);
        data.push(0x0B);

        self.module.section(&RawSection {
            id: SECTION_GLOBAL,
            data: &data,
        });
        self.globals_emitted = true;
    }

    fn emit_exports(&mut self, count: u32, range: Range<usize>) {
        let entries = self.entries(count, range);

        let mut data = Vec::with_capacity(entries.len() + POINTS_USED_EXPORT.len() + 8);
        (count + 1).encode(&mut data);
        data.extend_from_slice(entries);
        POINTS_USED_EXPORT.encode(&mut data);
        data.push(0x03); // global
        self.points_global.encode(&mut data);

        self.module.section(&RawSection {
            id: SECTION_EXPORT,
            data: &data,
        });
        self.exports_emitted = true;
    }

    fn instrument_body(&self, body: &FunctionBody<'a>) -> Result<Vec<u8>, MeteringError> {
        let range = body.range();
        let mut reader = body
            .get_operators_reader()
            .map_err(MeteringError::malformed)?;
        let code_start = reader.original_position();

        let mut offsets = Vec::new();
        let mut ends = Vec::new();
        while !reader.eof() {
            let (op, offset) = reader.read_with_offset().map_err(MeteringError::malformed)?;
            offsets.push(offset);
            ends.push(ends_segment(&op));
        }
        offsets.push(reader.original_position());

        let mut out = Vec::with_capacity(range.len() * 2);
        out.extend_from_slice(&self.bytes[range.start..code_start]);

        let mut segment_start = 0;
        let mut segment_cost: u64 = 0;
        let last = offsets.len() - 1;

        for i in 0..last {
            let offset = offsets[i];
            let index = opcode_index(self.bytes, offset)?;
            let cost = self.costs.get(index).unwrap_or(0);
            segment_cost = segment_cost.saturating_add(u64::from(cost));

            if ends[i] || i + 1 == last {
                self.emit_charge(&mut out, segment_cost);
                out.extend_from_slice(&self.bytes[offsets[segment_start]..offsets[i + 1]]);
                segment_start = i + 1;
                segment_cost = 0;
            }
        }

        Ok(out)
    }

    fn emit_charge(&self, out: &mut Vec<u8>, cost: u64) {
        if cost == 0 {
            return;
        }
        let points = self.points_global;
        let limit = points + 1;
        let cost = i64::try_from(cost).unwrap_or(i64::MAX);

        out.push(0x23); // global.get points
        points.encode(out);
        out.push(0x42); // i64.const cost
        cost.encode(out);
        out.push(0x7C); // i64.add
        out.push(0x24); // global.set points
        points.encode(out);

        // the sum wrapped iff it is below the cost: saturate and trap
        out.push(0x23); // global.get points
        points.encode(out);
        out.push(0x42); // i64.const cost
        cost.encode(out);
        out.push(0x54); // i64.lt_u
        out.extend_from_slice(&[0x04, 0x40]); // if
        out.push(0x42); // i64.const u64::MAX
        (-1_i64).encode(out);
        out.push(0x24); // global.set points
        points.encode(out);
        out.extend_from_slice(&[0x00, 0x0B]); // unreachable end

        out.push(0x23); // global.get points
        points.encode(out);
        out.push(0x23); // global.get limit
        limit.encode(out);
        out.push(0x56); // i64.gt_u

        // if unreachable end
        out.extend_from_slice(&[0x04, 0x40, 0x00, 0x0B]);
    }
}
