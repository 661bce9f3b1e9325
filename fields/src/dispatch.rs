//! The command dispatcher of spec.md §4.1: parses one newline-terminated
//! line at a time into an entity path plus an action, resolves it against
//! the [`Runtime`]'s [`Database`], and invokes the matching class or
//! attribute operation.
//!
//! Grounded on the teacher's `Bus`/`BusDevice` request-dispatch shape
//! (`devices::Bus::read`/`write` resolving a physical address down to a
//! device and a device-local offset before calling into it) — here the
//! "address" is a dotted entity path instead of a memory range, and the
//! "device" is a [`Field`]'s class or one of its attributes.

use std::sync::Arc;

use crate::attributes::Attribute;
use crate::change::ChangeClock;
use crate::change::ChangeFamily;
use crate::change::NEVER_SEEN;
use crate::data_options::collect_captured_fields;
use crate::database::Block;
use crate::database::Field;
use crate::error::CommandError;
use crate::error::CommandResult;
use crate::hardware::CAPTURE_BUS_COUNT;
use crate::mux::POS_MUX_ZERO_NAME;
use crate::parse::identifier;
use crate::runtime::Runtime;

/// A parsed `entity` per the §4.1 grammar, before block/field/attribute
/// names have been resolved against the database.
#[derive(Debug, PartialEq, Eq)]
struct EntityPath {
    /// The raw `name[index]` token, e.g. `"TTLIN1"` or `"PULSE"`.
    head: String,
    field: Option<String>,
    attribute: Option<String>,
    list_fields: bool,
    list_attributes: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TableWriteOptions {
    pub append: bool,
    pub binary_count: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Read,
    Write(String),
    Table(TableWriteOptions),
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedCommand {
    System { name: String, group: Option<String>, action: Action },
    Entity { path: EntityPath, action: Action },
}

fn parse_entity_path(head: &str) -> CommandResult<EntityPath> {
    let (rest, name) = identifier(head).map_err(|_| CommandError::UnknownCommand)?;
    let mut path = EntityPath { head: name.to_string(), field: None, attribute: None, list_fields: false, list_attributes: false };
    if rest.is_empty() {
        return Ok(path);
    }
    let rest = rest.strip_prefix('.').ok_or(CommandError::UnexpectedText)?;
    if rest == "*" {
        path.list_fields = true;
        return Ok(path);
    }
    let (rest, field) = identifier(rest).map_err(|_| CommandError::MalformedFieldListRequest)?;
    path.field = Some(field.to_string());
    if rest.is_empty() {
        return Ok(path);
    }
    let rest = rest.strip_prefix('.').ok_or(CommandError::UnexpectedText)?;
    if rest == "*" {
        path.list_attributes = true;
        return Ok(path);
    }
    let (rest, attribute) = identifier(rest).map_err(|_| CommandError::MalformedFieldListRequest)?;
    if !rest.is_empty() {
        return Err(CommandError::UnexpectedText);
    }
    path.attribute = Some(attribute.to_string());
    Ok(path)
}

fn parse_system_head(head: &str) -> CommandResult<(String, Option<String>)> {
    let (rest, name) = identifier(head).map_err(|_| CommandError::UnknownCommand)?;
    if rest.is_empty() {
        return Ok((name.to_string(), None));
    }
    let rest = rest.strip_prefix('.').ok_or(CommandError::UnexpectedText)?;
    let (rest, group) = identifier(rest).map_err(|_| CommandError::UnknownCommand)?;
    if !rest.is_empty() {
        return Err(CommandError::UnexpectedText);
    }
    Ok((name.to_string(), Some(group.to_string())))
}

fn parse_action(action: &str) -> CommandResult<Action> {
    let mut rest = action.chars();
    match rest.next() {
        Some('?') => {
            if !action[1..].trim().is_empty() {
                return Err(CommandError::UnexpectedText);
            }
            Ok(Action::Read)
        }
        Some('=') => Ok(Action::Write(action[1..].to_string())),
        Some('<') => {
            let tail = &action[1..];
            let (append, tail) = match tail.strip_prefix('<') {
                Some(t) => (true, t),
                None => (false, tail),
            };
            let tail = tail.trim_start();
            if tail.is_empty() {
                return Ok(Action::Table(TableWriteOptions { append, binary_count: None }));
            }
            let tail = tail.strip_prefix('B').ok_or(CommandError::UnexpectedText)?;
            let count: u32 = tail.trim().parse().map_err(|_| CommandError::UnexpectedText)?;
            Ok(Action::Table(TableWriteOptions { append, binary_count: Some(count) }))
        }
        _ => Err(CommandError::UnknownCommand),
    }
}

/// Splits `line` at its first `?`/`=`/`<` and parses both halves per the
/// §4.1 grammar. Parse errors abort before any side effect (spec.md §4.1's
/// failure model).
fn parse_command(line: &str) -> CommandResult<ParsedCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let split = line.find(['?', '=', '<']).ok_or(CommandError::UnknownCommand)?;
    let (head, action_text) = line.split_at(split);
    let action = parse_action(action_text)?;
    if let Some(sysname) = head.strip_prefix('*') {
        let (name, group) = parse_system_head(sysname)?;
        Ok(ParsedCommand::System { name, group, action })
    } else {
        let path = parse_entity_path(head)?;
        Ok(ParsedCommand::Entity { path, action })
    }
}

/// Resolves a block's name[index] token. A trailing digit run is an
/// instance index; its absence is legal only for a single-instance block
/// (spec.md §4.1's `index` rule, tested by scenario "omitting the instance
/// index on a block with count > 1 is rejected").
fn resolve_block<'a>(db: &'a crate::database::Database, head: &str) -> CommandResult<(&'a Block, u32)> {
    if let Some(block) = db.block(head) {
        return if block.count() == 1 { Ok((block, 0)) } else { Err(CommandError::NoSuchBlock) };
    }
    let digit_start = head.len() - head.chars().rev().take_while(char::is_ascii_digit).count();
    if digit_start == 0 || digit_start == head.len() {
        return Err(CommandError::NoSuchBlock);
    }
    let (name, digits) = head.split_at(digit_start);
    let block = db.block(name).ok_or(CommandError::NoSuchBlock)?;
    let index: u32 = digits.parse().map_err(|_| CommandError::NoSuchBlock)?;
    if index == 0 || index > block.count() {
        return Err(CommandError::BlockIndexTooHigh);
    }
    Ok((block, index - 1))
}

fn instance_label(block: &Block, n: u32) -> String {
    if block.count() == 1 {
        block.name().to_string()
    } else {
        format!("{}{}", block.name(), n + 1)
    }
}

/// One `OK`/`OK =.../`!.../.`/`ERR ...` response line, always terminated.
fn format_multi(lines: impl IntoIterator<Item = String>) -> String {
    let mut out = String::from("OK\n");
    for line in lines {
        out.push('!');
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(".\n");
    out
}

fn dispatch_attribute(attr: &Attribute, instance: u32, action: Action, clock: &ChangeClock) -> CommandResult<Option<String>> {
    match action {
        Action::Read => {
            if attr.has_format() {
                Ok(Some(format!("OK ={}\n", attr.format(instance)?)))
            } else {
                Ok(Some(format_multi(attr.get_many(instance)?)))
            }
        }
        Action::Write(value) => {
            attr.put(instance, value.trim())?;
            if attr.in_change_set() && !attr.polled_change_set() {
                attr.mark_changed(instance, clock);
            }
            Ok(Some("OK\n".to_string()))
        }
        Action::Table(_) => Err(CommandError::NotATable),
    }
}

/// Per-connection state the dispatcher needs across calls: the six
/// `*CHANGES` report indices (spec.md §4.5, one per [`ChangeFamily`]) and
/// any table write a previous line left open (spec.md §4.9's multi-line
/// payload).
pub struct Session {
    report_index: [u64; 6],
    pending: Option<PendingWrite>,
}

impl Session {
    pub fn new() -> Self {
        Session { report_index: [NEVER_SEEN; 6], pending: None }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingWrite {
    block: String,
    field: String,
    instance: u32,
    binary_count: Option<u32>,
}

fn family_slot(family: ChangeFamily) -> usize {
    ChangeFamily::ALL.iter().position(|f| *f == family).expect("ChangeFamily::ALL is exhaustive")
}

/// Resolves one textual command against a [`Runtime`] and produces the
/// response line(s) to write back to the client. Holds no per-connection
/// state itself — that lives in the caller's [`Session`], one per client
/// stream, so a single `Dispatcher` can be shared across connections.
pub struct Dispatcher {
    runtime: Arc<Runtime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Dispatcher { runtime }
    }

    /// Feeds one line of client input. Returns `None` only while a table
    /// write is still accepting payload lines (spec.md §4.9); every other
    /// path returns exactly one response line, `OK`/`OK =.../`!.../`ERR ...`
    /// (spec.md §4.1).
    pub fn handle_line(&self, session: &mut Session, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(pending) = session.pending.take() {
            return self.feed_table_write(session, pending, line);
        }
        match self.dispatch(session, line) {
            Ok(response) => response,
            Err(e) => Some(format!("ERR {e}\n")),
        }
    }

    /// Drops any table write left open by a connection that closed
    /// mid-payload (spec.md §5: "the writer's close path runs with
    /// `write_ok=false`").
    pub fn abort_pending(&self, session: &mut Session) {
        if let Some(pending) = session.pending.take() {
            if let Some(table) = self.lookup_table(&pending) {
                table.abort_write();
            }
        }
    }

    fn lookup_table(&self, pending: &PendingWrite) -> Option<&crate::table::TableBlock> {
        self.runtime.db.block(&pending.block)?.field(&pending.field)?.class().as_table(pending.instance)
    }

    /// Feeds one payload line of an open table write. Returns `None` while
    /// the write is still collecting rows — the multi-line payload protocol
    /// of spec.md §4.9 gets no per-line acknowledgement, only a final
    /// `OK`/`ERR` once the terminating blank line (ASCII mode) or word count
    /// (binary mode) is reached.
    fn feed_table_write(&self, session: &mut Session, pending: PendingWrite, line: &str) -> Option<String> {
        let table = match self.lookup_table(&pending) {
            Some(t) => t,
            None => return Some("ERR No such field\n".to_string()),
        };
        if pending.binary_count.is_none() && line.trim().is_empty() {
            return Some(close_table_write(table));
        }
        if let Err(e) = table.write_line(line) {
            return Some(format!("ERR {e}\n"));
        }
        if let Some(count) = pending.binary_count {
            if table.pending_len().unwrap_or(0) >= count as usize {
                return Some(close_table_write(table));
            }
        }
        session.pending = Some(pending);
        None
    }

    fn dispatch(&self, session: &mut Session, line: &str) -> CommandResult<Option<String>> {
        match parse_command(line)? {
            ParsedCommand::System { name, group, action } => self.dispatch_system(session, &name, group.as_deref(), action),
            ParsedCommand::Entity { path, action } => self.dispatch_entity(session, path, action),
        }
    }

    fn dispatch_entity(&self, session: &mut Session, path: EntityPath, action: Action) -> CommandResult<Option<String>> {
        let (block, instance) = resolve_block(&self.runtime.db, &path.head)?;

        if path.list_fields {
            if action != Action::Read {
                return Err(CommandError::MalformedFieldListRequest);
            }
            let names: Vec<String> = block.field_names().map(String::from).collect();
            return Ok(Some(format_multi(names)));
        }

        let field_name = path.field.as_deref().ok_or(CommandError::NoSuchField)?;
        let field = block.field(field_name).ok_or(CommandError::NoSuchField)?;

        if path.list_attributes {
            if action != Action::Read {
                return Err(CommandError::MalformedFieldListRequest);
            }
            let names: Vec<String> = field.attribute_names().map(String::from).collect();
            return Ok(Some(format_multi(names)));
        }

        if let Some(attr_name) = &path.attribute {
            let attribute = field.attribute(attr_name).ok_or(CommandError::MetaFieldNotFound)?;
            return dispatch_attribute(attribute, instance, action, &self.runtime.clock);
        }

        match action {
            Action::Table(opts) => {
                let table = field.class().as_table(instance).ok_or(CommandError::NotATable)?;
                table.open_write(opts.append, opts.binary_count.is_some())?;
                session.pending = Some(PendingWrite {
                    block: block.name().to_string(),
                    field: field_name.to_string(),
                    instance,
                    binary_count: opts.binary_count,
                });
                Ok(None)
            }
            Action::Read => {
                let class = field.class();
                class.refresh(instance);
                if let Some(table) = class.as_table(instance) {
                    return Ok(Some(format_multi(table.read_rows())));
                }
                match class.get(instance) {
                    Ok(v) => Ok(Some(format!("OK ={v}\n"))),
                    Err(CommandError::NotReadable) => Ok(Some(format_multi(class.get_many(instance)?))),
                    Err(e) => Err(e),
                }
            }
            Action::Write(value) => {
                field.class().put(instance, value.trim())?;
                Ok(Some("OK\n".to_string()))
            }
        }
    }

    fn dispatch_system(&self, session: &mut Session, name: &str, group: Option<&str>, action: Action) -> CommandResult<Option<String>> {
        match name {
            "IDN" => match action {
                Action::Read => Ok(Some("OK =PandA\n".to_string())),
                _ => Err(CommandError::NotWriteable),
            },
            "BLOCKS" => match action {
                Action::Read => {
                    let lines: Vec<String> = self
                        .runtime
                        .db
                        .block_names()
                        .map(|n| {
                            let block = self.runtime.db.block(n).expect("name came from block_names");
                            format!("{n} {}", block.count())
                        })
                        .collect();
                    Ok(Some(format_multi(lines)))
                }
                _ => Err(CommandError::NotWriteable),
            },
            "POSITIONS" => match action {
                Action::Read => {
                    let names: Vec<String> = self.runtime.pos_mux.snapshot().labels().filter(|n| *n != POS_MUX_ZERO_NAME).map(String::from).collect();
                    Ok(Some(format_multi(names)))
                }
                _ => Err(CommandError::NotWriteable),
            },
            "CAPTURE" => match action {
                Action::Read => Ok(Some(format!("OK ={}\n", u32::from(self.runtime.arm.is_active())))),
                Action::Write(value) => {
                    let enabled = matches!(value.trim(), "1" | "Enable" | "ENABLE");
                    if enabled {
                        let captured = collect_captured_fields(&self.runtime.db).len();
                        if captured > CAPTURE_BUS_COUNT {
                            return Err(CommandError::other(format!("capture scan list exceeds the {CAPTURE_BUS_COUNT}-wide capture bus")));
                        }
                    }
                    self.runtime.arm.set_active(enabled);
                    Ok(Some("OK\n".to_string()))
                }
                Action::Table(_) => Err(CommandError::NotATable),
            },
            "CHANGES" => self.dispatch_changes(session, group, action),
            _ => Err(CommandError::UnknownCommand),
        }
    }

    /// `*CHANGES[.group]?` of spec.md §4.5: computes, per requested family,
    /// every field-instance (or ATTR-family attribute-instance) whose
    /// update index exceeds this session's stored report index for that
    /// family, then advances the stored index to the current clock value.
    fn dispatch_changes(&self, session: &mut Session, group: Option<&str>, action: Action) -> CommandResult<Option<String>> {
        if action != Action::Read {
            return Err(CommandError::NotWriteable);
        }
        let families: Vec<ChangeFamily> = match group {
            None | Some("ALL") => ChangeFamily::ALL.to_vec(),
            Some(name) => vec![ChangeFamily::from_group_name(name).ok_or(CommandError::UnknownCommand)?],
        };

        if families.contains(&ChangeFamily::Bits) {
            self.runtime.bus.refresh_bits(self.runtime.hw.as_ref());
        }
        if families.contains(&ChangeFamily::Position) {
            self.runtime.bus.refresh_positions(self.runtime.hw.as_ref());
        }

        let mut lines = Vec::new();
        for block_name in self.runtime.db.block_names().map(str::to_string).collect::<Vec<_>>() {
            let block = self.runtime.db.block(&block_name).expect("name came from block_names");
            for field_name in block.field_names().map(str::to_string).collect::<Vec<_>>() {
                let field = block.field(&field_name).expect("name came from field_names");
                let class = field.class();
                if families.contains(&class.change_family()) {
                    let report = session.report_index[family_slot(class.change_family())];
                    for n in 0..block.count() {
                        if class.changed_since(n, report) {
                            lines.push(format_class_change(block, n, field));
                        }
                    }
                }
                if families.contains(&ChangeFamily::Attr) {
                    let report = session.report_index[family_slot(ChangeFamily::Attr)];
                    for attr_name in field.attribute_names().map(String::from).collect::<Vec<_>>() {
                        let attr = field.attribute(&attr_name).expect("name came from attribute_names");
                        if !attr.in_change_set() {
                            continue;
                        }
                        for n in 0..block.count() {
                            if attr.poll_changed(n, report, &self.runtime.clock)? {
                                lines.push(format_attr_change(block, n, field, attr));
                            }
                        }
                    }
                }
            }
        }

        let now = self.runtime.clock.current();
        for family in &families {
            session.report_index[family_slot(*family)] = now;
        }
        Ok(Some(format_multi(lines)))
    }
}

fn close_table_write(table: &crate::table::TableBlock) -> String {
    match table.close_write() {
        Ok(()) => "OK\n".to_string(),
        Err(e) => format!("ERR {e}\n"),
    }
}

/// `block.field=value`, or bare `block.field` when the class has no
/// single-line `get` (table fields: spec.md §4.9 gives no single value to
/// report for a table change, just that it changed).
fn format_class_change(block: &Block, n: u32, field: &Field) -> String {
    let label = instance_label(block, n);
    match field.class().get(n) {
        Ok(v) => format!("{label}.{}={v}", field.name()),
        Err(_) => format!("{label}.{}", field.name()),
    }
}

fn format_attr_change(block: &Block, n: u32, field: &Field, attr: &Attribute) -> String {
    let label = instance_label(block, n);
    match attr.format(n) {
        Ok(v) => format!("{label}.{}.{}={v}", field.name(), attr.name()),
        Err(_) => format!("{label}.{}.{}", field.name(), attr.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;

    fn runtime(config: &str, registers: &str) -> Arc<Runtime> {
        Arc::new(Runtime::load(config, registers, "", Arc::new(MockHardware::new())).unwrap())
    }

    #[test]
    fn spec_scenario_one_param_write_then_read() {
        let rt = runtime("TTLIN 1\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "TTLIN.VAL=7\n"), Some("OK\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "TTLIN.VAL?\n"), Some("OK =7\n".to_string()));
    }

    #[test]
    fn spec_scenario_two_time_raw_attribute() {
        let rt = runtime("PULSE 4\n  DELAY time s\n", "*REG 0\nPULSE 100\n  DELAY 0 1\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "PULSE1.DELAY=1.0\n"), Some("OK\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "PULSE1.DELAY.RAW?\n"), Some("OK =125000000\n".to_string()));
    }

    #[test]
    fn spec_scenario_three_table_round_trip() {
        let rt = runtime("SEQ 1\n  TABLE table 1\n", "*REG 0\nSEQ 300\n  TABLE 8\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "SEQ1.TABLE<\n"), None);
        assert_eq!(d.handle_line(&mut session, "1\n"), None);
        assert_eq!(d.handle_line(&mut session, "2\n"), None);
        assert_eq!(d.handle_line(&mut session, "3\n"), None);
        assert_eq!(d.handle_line(&mut session, "\n"), Some("OK\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "SEQ1.TABLE?\n"), Some("OK\n!1\n!2\n!3\n.\n".to_string()));
    }

    #[test]
    fn spec_scenario_four_changes_reports_only_new_writes() {
        let rt = runtime("TTLIN 1\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "*CHANGES?\n"), Some("OK\n!TTLIN.VAL=0\n.\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "*CHANGES?\n"), Some("OK\n.\n".to_string()));
        d.handle_line(&mut session, "TTLIN.VAL=9\n");
        assert_eq!(d.handle_line(&mut session, "*CHANGES?\n"), Some("OK\n!TTLIN.VAL=9\n.\n".to_string()));
    }

    #[test]
    fn spec_scenario_five_pos_mux_round_trip() {
        // COUNTER has two instances so its bus name carries an instance
        // number ("COUNTER1.OUT"), matching the mux naming rule in
        // database.rs's `mux_field_name`.
        let rt = runtime(
            "COUNTER 2\n  OUT pos_out\nPCAP 1\n  TRIG pos_mux\n",
            "*REG 0\n  BITS 0\nCOUNTER 100\n  OUT 5 6\nPCAP 200\n  TRIG 9\n",
        );
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "PCAP.TRIG=COUNTER1.OUT\n"), Some("OK\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "PCAP.TRIG?\n"), Some("OK =COUNTER1.OUT\n".to_string()));
    }

    #[test]
    fn omitted_index_rejected_for_multi_instance_block() {
        let rt = runtime("TTLIN 2\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "TTLIN.VAL?\n"), Some("ERR No such block\n".to_string()));
    }

    #[test]
    fn block_wildcard_lists_field_names() {
        let rt = runtime("TTLIN 1\n  VAL param uint\n  DIR param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n  DIR 1\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "TTLIN.*?\n"), Some("OK\n!VAL\n!DIR\n.\n".to_string()));
    }

    #[test]
    fn unknown_entity_reports_no_such_block() {
        let rt = runtime("TTLIN 1\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "NOPE.VAL?\n"), Some("ERR No such block\n".to_string()));
    }

    #[test]
    fn malformed_command_reports_unknown_command() {
        let rt = runtime("TTLIN 1\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "garbage with no action\n"), Some("ERR Unknown command\n".to_string()));
    }

    #[test]
    fn idn_and_blocks_system_commands() {
        let rt = runtime("TTLIN 6\n  VAL param uint\n", "*REG 0\nTTLIN 200\n  VAL 0\n");
        let d = Dispatcher::new(rt);
        let mut session = Session::new();
        assert_eq!(d.handle_line(&mut session, "*IDN?\n"), Some("OK =PandA\n".to_string()));
        assert_eq!(d.handle_line(&mut session, "*BLOCKS?\n"), Some("OK\n!TTLIN 6\n.\n".to_string()));
    }
}
