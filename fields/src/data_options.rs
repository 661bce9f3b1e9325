//! Data-options and header emission of spec.md §4.11: the only surface the
//! core exposes to the external data-capture pipeline. A client opens a
//! capture stream with a whitespace-separated option string, which parses
//! into a [`DataOptions`]; the core then walks every field currently armed
//! for capture (`CAPTURE != No`) and emits a header describing it.
//!
//! Grounded on the teacher's `serde_keyvalue`-style flag parsing already
//! used for [`crate::parse`]'s option tokens — this is the same "split on
//! whitespace, match each token against a closed vocabulary" shape, just
//! with aliases (`BARE`/`DEFAULT`) that expand into several fields at once
//! instead of one.

use crate::classes::CaptureInfo;
use crate::database::Database;
use crate::error::CommandError;
use crate::error::CommandResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Unframed,
    Framed,
    Base64,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProcess {
    Raw,
    Unscaled,
    Scaled,
}

/// The negotiated shape of one capture stream (spec.md §4.11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataOptions {
    pub data_format: DataFormat,
    pub data_process: DataProcess,
    pub omit_header: bool,
    pub omit_status: bool,
    pub one_shot: bool,
    pub xml_header: bool,
}

impl Default for DataOptions {
    /// `DEFAULT` of spec.md §4.11: Ascii+Scaled, everything else off.
    fn default() -> Self {
        DataOptions {
            data_format: DataFormat::Ascii,
            data_process: DataProcess::Scaled,
            omit_header: false,
            omit_status: false,
            one_shot: false,
            xml_header: false,
        }
    }
}

impl DataOptions {
    /// `BARE` of spec.md §4.11: Unframed+Unscaled, no headers, one-shot.
    fn bare() -> Self {
        DataOptions {
            data_format: DataFormat::Unframed,
            data_process: DataProcess::Unscaled,
            omit_header: true,
            omit_status: true,
            one_shot: true,
            xml_header: false,
        }
    }

    /// Parses the whitespace-separated option string a client sends on the
    /// capture subscription command. Tokens apply left to right, so a later
    /// `SCALED` after an earlier `BARE` wins.
    pub fn parse(options: &str) -> CommandResult<DataOptions> {
        let mut result = DataOptions::default();
        for token in options.split_whitespace() {
            match token.to_ascii_uppercase().as_str() {
                "BARE" => result = DataOptions::bare(),
                "DEFAULT" => result = DataOptions::default(),
                "UNFRAMED" => result.data_format = DataFormat::Unframed,
                "FRAMED" => result.data_format = DataFormat::Framed,
                "BASE64" => result.data_format = DataFormat::Base64,
                "ASCII" => result.data_format = DataFormat::Ascii,
                "RAW" => result.data_process = DataProcess::Raw,
                "UNSCALED" => result.data_process = DataProcess::Unscaled,
                "SCALED" => result.data_process = DataProcess::Scaled,
                "NO_HEADER" => result.omit_header = true,
                "NO_STATUS" => result.omit_status = true,
                "ONE_SHOT" => result.one_shot = true,
                "XML" => result.xml_header = true,
                _ => return Err(CommandError::other(format!("unknown data option '{token}'"))),
            }
        }
        Ok(result)
    }
}

/// One field currently armed for capture, as reported to the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedField {
    pub name: String,
    pub type_name: &'static str,
    pub capture_mode: String,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub units: Option<String>,
}

fn instance_label(block: &crate::database::Block, n: u32) -> String {
    if block.count() == 1 {
        block.name().to_string()
    } else {
        format!("{}{}", block.name(), n + 1)
    }
}

fn scaled_attribute(field: &crate::database::Field, name: &str) -> Option<f64> {
    field.attribute(name)?.format(0).ok()?.parse().ok()
}

/// Every field currently armed for capture (`CAPTURE != No`), in block
/// declaration order — the set the header describes and the hardware
/// capture consumer streams samples for.
pub fn collect_captured_fields(db: &Database) -> Vec<CapturedField> {
    let mut fields = Vec::new();
    for block_name in db.block_names().collect::<Vec<_>>() {
        let block = db.block(block_name).expect("name came from block_names");
        for field_name in block.field_names().collect::<Vec<_>>() {
            let field = block.field(field_name).expect("name came from field_names");
            for n in 0..block.count() {
                let CaptureInfo { mode, type_name } = match field.class().capture_info(n) {
                    Some(info) => info,
                    None => continue,
                };
                fields.push(CapturedField {
                    name: format!("{}.{}", instance_label(block, n), field.name()),
                    type_name,
                    capture_mode: mode,
                    scale: scaled_attribute(field, "SCALE"),
                    offset: scaled_attribute(field, "OFFSET"),
                    units: field.attribute("UNITS").and_then(|a| a.format(n).ok()),
                });
            }
        }
    }
    fields
}

/// Emits the field-description header spec.md §4.11 says the core produces
/// before streaming samples: one field per line, colon-indented by default,
/// or a minimal XML element per field when `xml_header` is set.
pub fn emit_header(fields: &[CapturedField], options: &DataOptions) -> String {
    if options.omit_header {
        return String::new();
    }
    if options.xml_header {
        emit_xml_header(fields)
    } else {
        emit_colon_header(fields)
    }
}

fn emit_colon_header(fields: &[CapturedField]) -> String {
    let mut out = String::new();
    for f in fields {
        out.push_str(&format!("{}:\n", f.name));
        out.push_str(&format!("    type: {}\n", f.type_name));
        out.push_str(&format!("    capture: {}\n", f.capture_mode));
        if let (Some(scale), Some(offset)) = (f.scale, f.offset) {
            out.push_str(&format!("    scale: {scale}\n"));
            out.push_str(&format!("    offset: {offset}\n"));
        }
        if let Some(units) = &f.units {
            out.push_str(&format!("    units: {units}\n"));
        }
    }
    out
}

fn emit_xml_header(fields: &[CapturedField]) -> String {
    let mut out = String::from("<header>\n");
    for f in fields {
        out.push_str(&format!(r#"  <field name="{}" type="{}" capture="{}""#, f.name, f.type_name, f.capture_mode));
        if let (Some(scale), Some(offset)) = (f.scale, f.offset) {
            out.push_str(&format!(r#" scale="{scale}" offset="{offset}""#));
        }
        if let Some(units) = &f.units {
            out.push_str(&format!(r#" units="{units}""#));
        }
        out.push_str(" />\n");
    }
    out.push_str("</header>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    #[test]
    fn bare_disables_headers_and_unscales() {
        let options = DataOptions::parse("BARE").unwrap();
        assert_eq!(options.data_format, DataFormat::Unframed);
        assert_eq!(options.data_process, DataProcess::Unscaled);
        assert!(options.omit_header);
        assert!(options.one_shot);
    }

    #[test]
    fn later_token_overrides_bare() {
        let options = DataOptions::parse("BARE SCALED XML").unwrap();
        assert_eq!(options.data_process, DataProcess::Scaled);
        assert!(options.xml_header);
        assert!(options.omit_header, "BARE's no-header flag is untouched by a later token that doesn't mention it");
    }

    #[test]
    fn unknown_token_rejected() {
        assert!(DataOptions::parse("NONSENSE").is_err());
    }

    #[test]
    fn uncaptured_fields_are_excluded() {
        let config = "TTLIN 2\n  VAL bit_out\n";
        let registers = "*REG 0\nTTLIN 100\n  VAL 4 5\n";
        let rt = Runtime::load(config, registers, "", Arc::new(MockHardware::new())).unwrap();
        assert!(collect_captured_fields(&rt.db).is_empty());
        rt.db.block("TTLIN").unwrap().field("VAL").unwrap().attribute("CAPTURE").unwrap().put(0, "Capture").unwrap();
        let captured = collect_captured_fields(&rt.db);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].name, "TTLIN1.VAL");
        assert_eq!(captured[0].capture_mode, "Capture");
        assert_eq!(captured[0].type_name, "bool");
    }

    #[test]
    fn colon_header_lists_every_captured_field() {
        let config = "TTLIN 2\n  VAL bit_out\n";
        let registers = "*REG 0\nTTLIN 100\n  VAL 4 5\n";
        let rt = Runtime::load(config, registers, "", Arc::new(MockHardware::new())).unwrap();
        let field = rt.db.block("TTLIN").unwrap().field("VAL").unwrap();
        field.attribute("CAPTURE").unwrap().put(0, "Capture").unwrap();
        field.attribute("CAPTURE").unwrap().put(1, "Capture").unwrap();
        let captured = collect_captured_fields(&rt.db);
        let header = emit_header(&captured, &DataOptions::default());
        assert!(header.contains("TTLIN1.VAL:\n"));
        assert!(header.contains("TTLIN2.VAL:\n"));
        assert!(header.contains("capture: Capture\n"));
    }

    #[test]
    fn omit_header_suppresses_output() {
        let options = DataOptions::parse("BARE").unwrap();
        assert_eq!(emit_header(&[], &options), "");
    }
}
