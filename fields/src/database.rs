//! The database loader of spec.md §4.10: reads `config`, `registers`, and
//! `description` as indented text, and builds the [`Database`] of
//! [`Block`]s and [`Field`]s the dispatcher resolves every command
//! against.
//!
//! Grounded on the teacher's root `main.rs`/`crosvm.rs` pattern of a
//! fallible, ordered start-up sequence that turns every failure into a
//! single typed error before `main` ever sees it — here that's
//! [`LoadError`], returned instead of propagated panics.

use std::collections::HashSet;
use std::sync::Arc;

use crate::attributes::Attribute;
use crate::attributes::AttrOps;
use crate::bus::capture_options;
use crate::bus::BusState;
use crate::bus::CaptureArm;
use crate::change::ChangeClock;
use crate::classes::BitOutClass;
use crate::classes::ExtOutClass;
use crate::classes::FieldClass;
use crate::classes::MuxSelectorClass;
use crate::classes::ParamClass;
use crate::classes::PosOutClass;
use crate::classes::ReadClass;
use crate::classes::TableClass;
use crate::classes::TimeClass;
use crate::classes::WriteClass;
use crate::error::CommandResult;
use crate::error::LoadError;
use crate::error::LoadResult;
use crate::hardware::HardwareBackend;
use crate::mux::MuxTable;
use crate::names::LabelSet;
use crate::names::NameMap;
use crate::parse::split_fields;
use crate::parse::split_indented_lines;
use crate::parse::IndentedLine;
use crate::table::TableBlock;
use crate::table::TableCapacity;
use crate::types::BitType;
use crate::types::EnumType;
use crate::types::FieldType;
use crate::types::IntType;
use crate::types::LutType;
use crate::types::PositionType;
use crate::types::RawValues;
use crate::types::ScalarType;
use crate::types::TimeType;
use crate::types::TimeUnit;
use crate::types::UintType;
use sync::Mutex;

/// A validated bit-slice sub-field of a table row (spec.md §4.9).
#[derive(Debug, Clone)]
pub struct TableSubfield {
    pub hi: u32,
    pub lo: u32,
    pub name: String,
    pub enum_ref: Option<String>,
}

pub struct Field {
    name: String,
    class: Box<dyn FieldClass>,
    description: Mutex<String>,
    attributes: NameMap<Attribute>,
    table_subfields: Vec<TableSubfield>,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &dyn FieldClass {
        self.class.as_ref()
    }

    pub fn description(&self) -> String {
        self.description.lock().clone()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.names()
    }

    pub fn table_subfields(&self) -> &[TableSubfield] {
        &self.table_subfields
    }
}

pub struct Block {
    name: String,
    count: u32,
    base: Mutex<Option<u32>>,
    description: Mutex<String>,
    fields: NameMap<Field>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn base(&self) -> Option<u32> {
        *self.base.lock()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.names()
    }

    pub fn description(&self) -> String {
        self.description.lock().clone()
    }
}

pub struct Database {
    blocks: NameMap<Block>,
}

impl Database {
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    pub fn block_names(&self) -> impl Iterator<Item = &str> {
        self.blocks.names()
    }
}

/// Shared runtime handles every register-bound class needs at construction
/// time — collected into one value rather than threaded as five separate
/// arguments through every loader function, per the teacher's Design Notes
/// §9 guidance on collecting global mutable state explicitly.
pub struct LoaderContext {
    pub hw: Arc<dyn HardwareBackend>,
    pub clock: Arc<ChangeClock>,
    pub bus: Arc<BusState>,
    pub arm: Arc<CaptureArm>,
    pub bit_mux: Arc<MuxTable>,
    pub pos_mux: Arc<MuxTable>,
}

// ---------------------------------------------------------------------
// Pass 1: `config` — blocks, fields, their class/type, dynamic enum
// entries and table sub-fields.
// ---------------------------------------------------------------------

struct PendingField {
    name: String,
    class_name: String,
    type_name: Option<String>,
    type_args: Vec<String>,
    dynamic_enum: Vec<(String, u32)>,
    table_subfields: Vec<TableSubfield>,
}

struct PendingBlock {
    name: String,
    count: u32,
    fields: Vec<PendingField>,
}

struct Node {
    line: IndentedLine,
    children: Vec<Node>,
}

/// Groups a flat, indent-resolved line stream into a forest, by indent
/// level. Shared by all three config files; each caller enforces its own
/// maximum depth.
fn build_forest(lines: &[IndentedLine]) -> Vec<Node> {
    fn build(lines: &[IndentedLine], pos: &mut usize, level: usize) -> Vec<Node> {
        let mut nodes = Vec::new();
        while *pos < lines.len() && lines[*pos].indent >= level {
            if lines[*pos].indent > level {
                break;
            }
            let line = lines[*pos].clone();
            *pos += 1;
            let children = build(lines, pos, level + 1);
            nodes.push(Node { line, children });
        }
        nodes
    }
    let mut pos = 0;
    build(lines, &mut pos, 0)
}

fn parse_config(text: &str) -> LoadResult<Vec<PendingBlock>> {
    let lines = split_indented_lines(text);
    if let Some(bad) = lines.iter().find(|l| l.indent > 2) {
        return Err(LoadError::ConfigParse(format!("line {}: indent too deep for config", bad.line_no)));
    }
    let forest = build_forest(&lines);
    let mut blocks = Vec::new();
    for block_node in forest {
        let tokens = split_fields(&block_node.line.text);
        let name = tokens
            .first()
            .ok_or_else(|| LoadError::ConfigParse(format!("line {}: empty block header", block_node.line.line_no)))?
            .to_string();
        let count: u32 = match tokens.get(1) {
            Some(s) => s.parse().map_err(|_| LoadError::ConfigParse(format!("line {}: bad instance count", block_node.line.line_no)))?,
            None => 1,
        };
        if !(1..=16).contains(&count) {
            return Err(LoadError::ConfigParse(format!("block '{name}': instance count out of range 1..16")));
        }

        let mut fields = Vec::new();
        for field_node in &block_node.children {
            let ftokens = split_fields(&field_node.line.text);
            let fname = ftokens
                .first()
                .ok_or_else(|| LoadError::ConfigParse(format!("line {}: empty field line", field_node.line.line_no)))?
                .to_string();
            let class_name = ftokens
                .get(1)
                .ok_or_else(|| LoadError::ConfigParse(format!("field '{fname}': missing class")))?
                .to_string();
            let type_name = ftokens.get(2).map(|s| s.to_string());
            let type_args: Vec<String> = ftokens.iter().skip(3).map(|s| s.to_string()).collect();

            let mut dynamic_enum = Vec::new();
            let mut table_subfields = Vec::new();
            for attr_node in &field_node.children {
                let atokens = split_fields(&attr_node.line.text);
                if atokens.len() >= 3 && atokens[1] == "=" {
                    let index: u32 = atokens[2]
                        .parse()
                        .map_err(|_| LoadError::ConfigParse(format!("field '{fname}': bad enum index '{}'", atokens[2])))?;
                    dynamic_enum.push((atokens[0].to_string(), index));
                } else if let Some((hi, lo)) = atokens.first().and_then(|t| t.split_once(':')) {
                    let hi: u32 = hi.parse().map_err(|_| LoadError::ConfigParse(format!("field '{fname}': bad subfield range")))?;
                    let lo: u32 = lo.parse().map_err(|_| LoadError::ConfigParse(format!("field '{fname}': bad subfield range")))?;
                    let sub_name = atokens
                        .get(1)
                        .ok_or_else(|| LoadError::ConfigParse(format!("field '{fname}': subfield missing a name")))?
                        .to_string();
                    let enum_ref = atokens.get(2).map(|s| s.to_string());
                    table_subfields.push(TableSubfield { hi, lo, name: sub_name, enum_ref });
                } else {
                    return Err(LoadError::ConfigParse(format!(
                        "field '{fname}': unrecognised attribute line '{}'",
                        attr_node.line.text
                    )));
                }
            }
            validate_subfields(&fname, &table_subfields)?;

            fields.push(PendingField { name: fname, class_name, type_name, type_args, dynamic_enum, table_subfields });
        }
        blocks.push(PendingBlock { name, count, fields });
    }
    Ok(blocks)
}

fn validate_subfields(field: &str, subfields: &[TableSubfield]) -> LoadResult<()> {
    let mut sorted: Vec<&TableSubfield> = subfields.iter().collect();
    sorted.sort_by_key(|s| s.lo);
    for s in &sorted {
        if s.hi < s.lo {
            return Err(LoadError::ConfigParse(format!("field '{field}': subfield '{}' has hi < lo", s.name)));
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].lo <= pair[0].hi {
            return Err(LoadError::ConfigParse(format!(
                "field '{field}': subfields '{}' and '{}' overlap",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

fn build_type(type_name: &str, type_args: &[String], count: usize, dynamic_enum: &[(String, u32)]) -> LoadResult<Box<dyn FieldType>> {
    match type_name {
        "uint" => Ok(Box::new(UintType)),
        "int" => Ok(Box::new(IntType)),
        "bit" => Ok(Box::new(BitType)),
        "lut" => Ok(Box::new(LutType)),
        "scalar" => {
            let scale: f64 = type_args.first().map(|s| s.parse()).transpose().map_err(|_| LoadError::ConfigParse("bad scalar scale".into()))?.unwrap_or(1.0);
            let offset: f64 = type_args.get(1).map(|s| s.parse()).transpose().map_err(|_| LoadError::ConfigParse("bad scalar offset".into()))?.unwrap_or(0.0);
            let units = type_args.get(2).cloned().unwrap_or_default();
            Ok(Box::new(ScalarType::new(count, scale, offset, units)))
        }
        "position" => {
            let scale: f64 = type_args.first().map(|s| s.parse()).transpose().map_err(|_| LoadError::ConfigParse("bad position scale".into()))?.unwrap_or(1.0);
            let offset: f64 = type_args.get(1).map(|s| s.parse()).transpose().map_err(|_| LoadError::ConfigParse("bad position offset".into()))?.unwrap_or(0.0);
            let units = type_args.get(2).cloned().unwrap_or_default();
            Ok(Box::new(PositionType::new(count, scale, offset, units)))
        }
        "time" => {
            let default_unit = type_args.first().and_then(|s| TimeUnit::from_name(s)).unwrap_or(TimeUnit::Sec);
            Ok(Box::new(TimeType::new(count, default_unit)))
        }
        "enum" => {
            if !dynamic_enum.is_empty() {
                let mut labels = LabelSet::new_dynamic();
                for (name, index) in dynamic_enum {
                    labels.insert(name.clone(), *index).map_err(LoadError::ConfigParse)?;
                }
                Ok(Box::new(EnumType::new_dynamic(labels)))
            } else {
                Ok(Box::new(EnumType::new_static(type_args)))
            }
        }
        other => Err(LoadError::ConfigParse(format!("unknown type '{other}'"))),
    }
}

// ---------------------------------------------------------------------
// Pass 2: `registers` — block bases, `*REG`, per-field register specs.
// ---------------------------------------------------------------------

fn parse_registers(text: &str) -> LoadResult<Vec<Node>> {
    let lines = split_indented_lines(text);
    if let Some(bad) = lines.iter().find(|l| l.indent > 1) {
        return Err(LoadError::ConfigParse(format!("line {}: indent too deep for registers", bad.line_no)));
    }
    Ok(build_forest(&lines))
}

fn parse_bus_index_list(tokens: &[&str], count: usize) -> LoadResult<(Vec<u32>, Option<Vec<u32>>)> {
    let split = tokens.iter().position(|t| *t == "/");
    let (primary, rest) = match split {
        Some(i) => (&tokens[..i], &tokens[i + 1..]),
        None => (tokens, &[][..]),
    };
    let primary = parse_uint_list(primary)?;
    if primary.len() != count {
        return Err(LoadError::ConfigParse(format!("expected {count} bus indices, got {}", primary.len())));
    }
    let secondary = if rest.is_empty() { None } else { Some(parse_uint_list(rest)?) };
    Ok((primary, secondary))
}

fn parse_uint_list(tokens: &[&str]) -> LoadResult<Vec<u32>> {
    tokens
        .iter()
        .map(|t| t.parse::<u32>().map_err(|_| LoadError::ConfigParse(format!("bad register index '{t}'"))))
        .collect()
}

/// Wraps a [`TimeClass`] handle's `units`/`set_units`/`min`/`raw` methods as
/// the `RAW`/`UNITS`/`MIN` attributes spec.md §4.8 names explicitly (and
/// spec scenario 2 exercises: `PULSE1.DELAY.RAW?`).
fn time_attributes(class: &TimeClass) -> NameMap<Attribute> {
    let mut attrs = NameMap::new();
    let raw_get = class.clone();
    attrs.insert(
        "RAW",
        Attribute::new("RAW".into(), "Unscaled tick count".into(), true, true, AttrOps::format(move |n| Ok(raw_get.raw(n).to_string()))),
    );
    let units_get = class.clone();
    let units_put = class.clone();
    attrs.insert(
        "UNITS",
        Attribute::new(
            "UNITS".into(),
            "Time unit (min/s/ms/us)".into(),
            true,
            true,
            AttrOps::format_and_put(move |n| units_get.units(n), move |n, v| units_put.set_units(n, v)),
        ),
    );
    let min_get = class.clone();
    attrs.insert(
        "MIN",
        Attribute::new("MIN".into(), "Forbidden-band upper bound in the current unit".into(), true, true, AttrOps::format(move |n| Ok(min_get.min(n)))),
    );
    attrs
}

/// `LENGTH` (row count) and `B` (base64 readback) of spec.md §4.9.
fn table_attributes(blocks: &[Arc<TableBlock>]) -> NameMap<Attribute> {
    let mut attrs = NameMap::new();
    let len_blocks = blocks.to_vec();
    attrs.insert(
        "LENGTH",
        Attribute::new("LENGTH".into(), "Committed row count".into(), true, true, AttrOps::format(move |n| Ok(len_blocks[n as usize].length().to_string()))),
    );
    let b64_blocks = blocks.to_vec();
    attrs.insert("B", Attribute::new("B".into(), "Base64-encoded committed rows".into(), false, false, AttrOps::get_many(move |n| Ok(b64_blocks[n as usize].read_base64_rows()))));
    attrs
}

/// `CAPTURE` (spec.md §4.6), shared by `bit_out`/`pos_out`/`ext_out` over
/// whichever `capture()` accessor the caller's class clone exposes.
fn capture_attribute(
    get: impl Fn(u32) -> CommandResult<String> + Send + Sync + 'static,
    put: impl Fn(u32, &str) -> CommandResult<()> + Send + Sync + 'static,
    enumeration: impl Fn() -> Option<LabelSet> + Send + Sync + 'static,
) -> NameMap<Attribute> {
    let mut attrs = NameMap::new();
    attrs.insert(
        "CAPTURE",
        Attribute::new("CAPTURE".into(), "Capture selection".into(), true, true, AttrOps::format_and_put(get, put).with_enumeration(enumeration)),
    );
    attrs
}

fn build_class(
    pending: &PendingField,
    count: usize,
    block_name: &str,
    block_base: u32,
    reg_tokens: &[&str],
    ctx: &LoaderContext,
) -> LoadResult<(Box<dyn FieldClass>, NameMap<Attribute>)> {
    let raw_count = count;
    match pending.class_name.as_str() {
        "param" | "read" | "write" => {
            let reg: u32 = reg_tokens
                .first()
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation(format!("field '{}': bad register number", pending.name)))?;
            let type_name = pending.type_name.clone().unwrap_or_else(|| "uint".to_string());
            let field_type = build_type(&type_name, &pending.type_args, raw_count, &pending.dynamic_enum).map_err(to_register_error)?;
            let raw = RawValues::new(raw_count, ctx.clock.clone());
            let mut attrs = NameMap::new();
            for (name, attr) in field_type.attributes(raw.clone()) {
                attrs.insert(name, attr);
            }
            let class = match pending.class_name.as_str() {
                "param" => Box::new(ParamClass::new(raw, field_type, ctx.hw.clone(), block_base, reg)) as Box<dyn FieldClass>,
                "read" => Box::new(ReadClass::new(raw, field_type, ctx.hw.clone(), block_base, reg)) as Box<dyn FieldClass>,
                _ => Box::new(WriteClass::new(raw, field_type, ctx.hw.clone(), block_base, reg)) as Box<dyn FieldClass>,
            };
            Ok((class, attrs))
        }
        "ext_out" => {
            let reg: u32 = reg_tokens
                .first()
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation(format!("field '{}': bad register number", pending.name)))?;
            let raw = RawValues::new(raw_count, ctx.clock.clone());
            let variant = pending.type_args.first().map(String::as_str);
            let options = if variant == Some("timestamp") { capture_options::EXT_OUT_TIMESTAMP } else { capture_options::EXT_OUT };
            let class = ExtOutClass::new(raw_count, raw, ctx.hw.clone(), block_base, reg, ctx.arm.clone(), options);
            let (g, p, e) = (class.clone(), class.clone(), class.clone());
            let attrs = capture_attribute(move |n| g.capture().get(n), move |n, v| p.capture().put(n, v), move || Some(e.capture().enumeration()));
            Ok((Box::new(class), attrs))
        }
        "time" => {
            let low: u32 = reg_tokens
                .first()
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing low register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation("bad low register".into()))?;
            let high: u32 = reg_tokens
                .get(1)
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing high register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation("bad high register".into()))?;
            let min_value: u64 = if reg_tokens.get(2) == Some(&">") {
                reg_tokens.get(3).and_then(|s| s.parse().ok()).unwrap_or(0)
            } else {
                0
            };
            let default_unit = pending.type_args.first().and_then(|s| TimeUnit::from_name(s)).unwrap_or(TimeUnit::Sec);
            let class = TimeClass::new(raw_count, default_unit, min_value, ctx.hw.clone(), block_base, low, high, ctx.clock.clone());
            let attrs = time_attributes(&class);
            Ok((Box::new(class), attrs))
        }
        "bit_mux" => {
            let reg: u32 = reg_tokens
                .first()
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation("bad register".into()))?;
            let raw = RawValues::new(raw_count, ctx.clock.clone());
            Ok((Box::new(MuxSelectorClass::new(raw, ctx.bit_mux.clone(), ctx.hw.clone(), block_base, reg)), NameMap::new()))
        }
        "pos_mux" => {
            let reg: u32 = reg_tokens
                .first()
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing register", pending.name)))?
                .parse()
                .map_err(|_| LoadError::RegisterValidation("bad register".into()))?;
            let raw = RawValues::new(raw_count, ctx.clock.clone());
            Ok((Box::new(MuxSelectorClass::new(raw, ctx.pos_mux.clone(), ctx.hw.clone(), block_base, reg)), NameMap::new()))
        }
        "bit_out" => {
            let (primary, _secondary) = parse_bus_index_list(reg_tokens, raw_count)?;
            for (n, &line) in primary.iter().enumerate() {
                ctx.bit_mux
                    .register(mux_field_name(block_name, &pending.name, n, raw_count), line)
                    .map_err(|e| LoadError::RegisterValidation(e.to_string()))?;
            }
            let class = BitOutClass::new(primary, ctx.bus.clone(), ctx.arm.clone(), ctx.hw.clone());
            let (g, p, e) = (class.clone(), class.clone(), class.clone());
            let attrs = capture_attribute(move |n| g.capture().get(n), move |n, v| p.capture().put(n, v), move || Some(e.capture().enumeration()));
            Ok((Box::new(class), attrs))
        }
        "pos_out" => {
            let (primary, _secondary) = parse_bus_index_list(reg_tokens, raw_count)?;
            for (n, &line) in primary.iter().enumerate() {
                ctx.pos_mux
                    .register(mux_field_name(block_name, &pending.name, n, raw_count), line)
                    .map_err(|e| LoadError::RegisterValidation(e.to_string()))?;
            }
            let variant = pending.type_args.first().map(String::as_str);
            let options = match variant {
                Some("encoder") => capture_options::POS_OUT_ENCODER,
                Some("adc") => capture_options::POS_OUT_ADC,
                _ => capture_options::POS_OUT,
            };
            let class = PosOutClass::new(primary, ctx.bus.clone(), ctx.arm.clone(), ctx.hw.clone(), options);
            let (g, p, e) = (class.clone(), class.clone(), class.clone());
            let attrs = capture_attribute(move |n| g.capture().get(n), move |n, v| p.capture().put(n, v), move || Some(e.capture().enumeration()));
            Ok((Box::new(class), attrs))
        }
        "table" => {
            let row_width: usize = pending.type_args.first().and_then(|s| s.parse().ok()).unwrap_or(1);
            let is_long = reg_tokens.first().map(|s| s.starts_with("2^")).unwrap_or(false);
            let mut blocks = Vec::with_capacity(raw_count);
            for n in 0..raw_count {
                let capacity = if is_long {
                    let order: u32 = reg_tokens[0]
                        .strip_prefix("2^")
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': bad long-table order", pending.name)))?;
                    let base_reg: u32 = reg_tokens
                        .get(1)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing long-table base", pending.name)))?;
                    ctx.hw.open_long_table(block_base, n as u32, order, base_reg);
                    TableCapacity::Long { order }
                } else {
                    let max_length: u32 = reg_tokens
                        .first()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| LoadError::RegisterValidation(format!("field '{}': missing short-table max_length", pending.name)))?;
                    ctx.hw.open_short_table(block_base, n as u32, 0, max_length);
                    TableCapacity::Short { max_length }
                };
                blocks.push(Arc::new(TableBlock::new(ctx.hw.clone(), ctx.clock.clone(), block_base, n as u32, row_width.max(1), capacity)));
            }
            let attrs = table_attributes(&blocks);
            Ok((Box::new(TableClass::new(blocks)), attrs))
        }
        other => Err(LoadError::RegisterValidation(format!("unknown class '{other}'"))),
    }
}

/// Builds the `blockNfield` name the mux enumerations key on (spec.md
/// §4.7), e.g. `COUNTER1.OUT`. Single-instance blocks omit the instance
/// number, matching the command grammar's own rule that an omitted index
/// is only legal for single-instance blocks.
fn mux_field_name(block_name: &str, field_name: &str, instance: usize, count: usize) -> String {
    if count == 1 {
        format!("{block_name}.{field_name}")
    } else {
        format!("{block_name}{}.{field_name}", instance + 1)
    }
}

fn to_register_error(e: LoadError) -> LoadError {
    match e {
        LoadError::ConfigParse(msg) => LoadError::RegisterValidation(msg),
        other => other,
    }
}

/// Reads `config`, `registers`, `description` from `dir` and builds a
/// fully bound, validated [`Database`] — the five ordered rules of
/// spec.md §4.10.
pub fn load(
    config_text: &str,
    registers_text: &str,
    description_text: &str,
    ctx: &LoaderContext,
) -> LoadResult<Database> {
    let pending_blocks = parse_config(config_text)?;
    let mut pending_by_name: NameMap<PendingBlock> = NameMap::new();
    for b in pending_blocks {
        if pending_by_name.insert(b.name.clone(), b).is_some() {
            return Err(LoadError::ConfigParse("duplicate block name in config".to_string()));
        }
    }

    let reg_forest = parse_registers(registers_text)?;
    let mut finalised: HashSet<String> = HashSet::new();
    let mut blocks: NameMap<Block> = NameMap::new();

    let mut forest_iter = reg_forest.into_iter().peekable();

    if let Some(first) = forest_iter.peek() {
        let tokens = split_fields(&first.line.text);
        if tokens.first() == Some(&"*REG") {
            let node = forest_iter.next().unwrap();
            let reg_base: u32 = tokens
                .get(1)
                .ok_or_else(|| LoadError::ConfigParse("*REG missing base".to_string()))?
                .parse()
                .map_err(|_| LoadError::ConfigParse("*REG base not a number".to_string()))?;
            for child in &node.children {
                let t = split_fields(&child.line.text);
                let name = t.first().ok_or_else(|| LoadError::ConfigParse("empty *REG entry".to_string()))?;
                let reg: u32 = t
                    .get(1)
                    .ok_or_else(|| LoadError::ConfigParse(format!("*REG entry '{name}' missing register number")))?
                    .parse()
                    .map_err(|_| LoadError::ConfigParse(format!("*REG entry '{name}' bad register number")))?;
                ctx.hw.set_named_register(name, reg_base, reg);
            }
        }
    }

    for block_node in forest_iter {
        // Any further `*REG`-named block is rule 2's violation: it must
        // precede every normal block, not interleave with them.
        let tokens = split_fields(&block_node.line.text);
        if tokens.first() == Some(&"*REG") {
            return Err(LoadError::ConfigParse("*REG must be the first block in registers".to_string()));
        }
        let name = tokens.first().ok_or_else(|| LoadError::ConfigParse("empty block header in registers".to_string()))?.to_string();
        let base: u32 = tokens
            .get(1)
            .ok_or_else(|| LoadError::ConfigParse(format!("block '{name}' missing base in registers")))?
            .parse()
            .map_err(|_| LoadError::ConfigParse(format!("block '{name}' base is not a number")))?;

        let pending = pending_by_name
            .get(&name)
            .ok_or_else(|| LoadError::RegisterValidation(format!("block '{name}' in registers is not defined in config")))?;
        ctx.hw.set_block_base(base, base);

        let mut fields: NameMap<Field> = NameMap::new();
        for field_node in &block_node.children {
            let ftokens = split_fields(&field_node.line.text);
            let fname = ftokens.first().ok_or_else(|| LoadError::RegisterValidation("empty field line in registers".to_string()))?.to_string();
            let pending_field = pending
                .fields
                .iter()
                .find(|f| f.name == fname)
                .ok_or_else(|| LoadError::RegisterValidation(format!("field '{name}.{fname}' in registers is not defined in config")))?;
            let reg_tokens = &ftokens[1..];
            let key = format!("{name}.{fname}");
            if !finalised.insert(key.clone()) {
                return Err(LoadError::RegisterValidation(format!("field '{key}': Register already assigned")));
            }
            let (class, attributes) = build_class(pending_field, pending.count as usize, &name, base, reg_tokens, ctx)?;
            fields.insert(
                fname.clone(),
                Field {
                    name: fname,
                    class,
                    description: Mutex::new(String::new()),
                    attributes,
                    table_subfields: pending_field.table_subfields.clone(),
                },
            );
        }
        blocks.insert(
            name.clone(),
            Block { name, count: pending.count, base: Mutex::new(Some(base)), description: Mutex::new(String::new()), fields },
        );
    }

    for name in pending_by_name.names() {
        let pending = pending_by_name.get(name).unwrap();
        for field in &pending.fields {
            let key = format!("{name}.{}", field.name);
            if !finalised.contains(&key) {
                return Err(LoadError::RegisterValidation(format!("field '{key}' has no register binding")));
            }
        }
    }

    apply_descriptions(description_text, &mut blocks)?;

    for block_name in blocks.names().map(str::to_string).collect::<Vec<_>>() {
        let block = blocks.get(&block_name).unwrap();
        for field_name in block.field_names().map(str::to_string).collect::<Vec<_>>() {
            block.field(&field_name).unwrap().class().finalise();
        }
    }

    ctx.hw.validate().map_err(LoadError::HardwareOpen)?;

    Ok(Database { blocks })
}

fn apply_descriptions(text: &str, blocks: &mut NameMap<Block>) -> LoadResult<()> {
    let lines = split_indented_lines(text);
    if let Some(bad) = lines.iter().find(|l| l.indent > 1) {
        return Err(LoadError::ConfigParse(format!("line {}: indent too deep for description", bad.line_no)));
    }
    let forest = build_forest(&lines);
    for block_node in forest {
        let mut tokens = block_node.line.text.splitn(2, char::is_whitespace);
        let name = tokens.next().unwrap_or_default();
        let desc = tokens.next().unwrap_or_default().trim();
        if let Some(block) = blocks.get(name) {
            *block.description.lock() = desc.to_string();
        }
        for field_node in &block_node.children {
            let mut ftokens = field_node.line.text.splitn(2, char::is_whitespace);
            let fname = ftokens.next().unwrap_or_default();
            let fdesc = ftokens.next().unwrap_or_default().trim();
            if let Some(block) = blocks.get(name) {
                if let Some(field) = block.field(fname) {
                    *field.description.lock() = fdesc.to_string();
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;

    fn ctx() -> LoaderContext {
        LoaderContext {
            hw: Arc::new(MockHardware::new()),
            clock: Arc::new(ChangeClock::new()),
            bus: BusState::new(Arc::new(ChangeClock::new())),
            arm: Arc::new(CaptureArm::new()),
            bit_mux: MuxTable::new_bit_mux(),
            pos_mux: MuxTable::new_pos_mux(),
        }
    }

    #[test]
    fn loads_a_minimal_database() {
        let config = "PULSE 4\n  DELAY time\n  WIDTH param uint\nTTLIN 6\n  VAL bit_out\n";
        let registers = "*REG 0\n  BITS 0\nPULSE 100\n  DELAY 0 1\n  WIDTH 2\nTTLIN 200\n  VAL 0 1 2 3 4 5\n";
        let description = "PULSE a pulse generator\n  DELAY the pulse delay\n";
        let ctx = ctx();
        let db = load(config, registers, description, &ctx).unwrap();
        let pulse = db.block("PULSE").unwrap();
        assert_eq!(pulse.count(), 4);
        assert_eq!(pulse.description(), "a pulse generator");
        let delay = pulse.field("DELAY").unwrap();
        assert_eq!(delay.description(), "the pulse delay");
        delay.class().put(0, "1.0").unwrap();
        assert_eq!(delay.class().get(0).unwrap(), "1");
    }

    #[test]
    fn time_raw_attribute_matches_spec_example_two() {
        let config = "PULSE 4\n  DELAY time s\n";
        let registers = "*REG 0\nPULSE 100\n  DELAY 0 1\n";
        let ctx = ctx();
        let db = load(config, registers, "", &ctx).unwrap();
        let delay = db.block("PULSE").unwrap().field("DELAY").unwrap();
        delay.class().put(1, "1.0").unwrap();
        let raw = delay.attribute("RAW").unwrap();
        assert_eq!(raw.format(1).unwrap(), "125000000");
    }

    #[test]
    fn table_length_and_b_attributes_reflect_writes() {
        let config = "SEQ 1\n  TABLE table 1\n";
        let registers = "*REG 0\nSEQ 300\n  TABLE 64\n";
        let ctx = ctx();
        let db = load(config, registers, "", &ctx).unwrap();
        let field = db.block("SEQ").unwrap().field("TABLE").unwrap();
        let table = field.class().as_table(0).unwrap();
        table.open_write(false, false).unwrap();
        table.write_line("9").unwrap();
        table.close_write().unwrap();
        assert_eq!(field.attribute("LENGTH").unwrap().format(0).unwrap(), "1");
        assert_eq!(field.attribute("B").unwrap().get_many(0).unwrap(), table.read_base64_rows());
    }

    #[test]
    fn bit_out_capture_attribute_round_trips() {
        let config = "TTLIN 6\n  VAL bit_out\n";
        let registers = "*REG 0\n  BITS 0\nTTLIN 200\n  VAL 0 1 2 3 4 5\n";
        let ctx = ctx();
        let db = load(config, registers, "", &ctx).unwrap();
        let val = db.block("TTLIN").unwrap().field("VAL").unwrap();
        let capture = val.attribute("CAPTURE").unwrap();
        capture.put(0, "Capture").unwrap();
        assert_eq!(capture.format(0).unwrap(), "Capture");
    }

    #[test]
    fn rejects_register_binding_for_unknown_field() {
        let config = "PULSE 1\n  DELAY time\n";
        let registers = "*REG 0\nPULSE 100\n  WIDTH 2\n";
        let ctx = ctx();
        assert!(load(config, registers, "", &ctx).is_err());
    }

    #[test]
    fn rejects_unbound_field() {
        let config = "PULSE 1\n  DELAY time\n  WIDTH param uint\n";
        let registers = "*REG 0\nPULSE 100\n  DELAY 0 1\n";
        let ctx = ctx();
        assert!(load(config, registers, "", &ctx).is_err());
    }

    #[test]
    fn table_field_round_trips_after_loading() {
        let config = "SEQ 1\n  TABLE table 1\n";
        let registers = "*REG 0\nSEQ 300\n  TABLE 64\n";
        let ctx = ctx();
        let db = load(config, registers, "", &ctx).unwrap();
        let field = db.block("SEQ").unwrap().field("TABLE").unwrap();
        let table = field.class().as_table(0).unwrap();
        table.open_write(false, false).unwrap();
        table.write_line("1 2 3").unwrap();
        table.close_write().unwrap();
        assert_eq!(table.read_rows(), vec!["1", "2", "3"]);
    }
}
