//! The INI configuration grammar (§6/§11): `[Section]` headers, `Key=Value` lines, `;`/`#`
//! full-line comments, blank lines ignored. `[System]`'s `Type=` selects a system class name;
//! every other section names a component instance, whose own `Type=` (if present) selects which
//! component implementation to construct and whose remaining keys become that component's
//! configuration properties.
//!
//! Grounded on `pce/system_config_parser.cpp`'s `System::ParseConfig`: the
//! system-section/component-sections split, `Type=` as the one property every section handles
//! specially, and the numbered user-facing error codes are all carried over (1-4 here for
//! grammar; `sim86-machine` continues the same numbering from 5 upward for the semantic errors
//! that need its system/component type registry to detect — unknown type names, duplicate
//! built-ins, missing `Type=` on a non-built-in section — since `sim86-config` itself has no
//! knowledge of what types exist).

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ConfigError {
    pub code: u32,
    pub message: String,
}

impl ConfigError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// One `[Section]` block's raw `Key=Value` pairs, in file order, plus the section name.
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub name: String,
    properties: HashMap<String, String>,
    order: Vec<String>,
}

impl Section {
    fn insert(&mut self, key: String, value: String) {
        if !self.properties.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.properties.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All keys except `Type`, in the order they first appeared — the set `ApplyProperties`
    /// iterates over in the original.
    pub fn property_keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str).filter(|k| *k != "Type")
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.property_keys().map(|k| (k.to_string(), self.properties[k].clone())).collect()
    }

    pub fn component_type(&self) -> Option<&str> {
        self.get("Type")
    }
}

/// A parsed configuration file: the `[System]` section plus every other section in file order.
/// `sim86-machine` resolves `System`'s `Type=` and each section's `Type=` against its own
/// class/component registries; this type only knows INI structure.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub system: Section,
    pub components: Vec<Section>,
}

impl SystemConfig {
    pub fn system_type(&self) -> Option<&str> {
        self.system.get("Type")
    }

    pub fn component(&self, identifier: &str) -> Option<&Section> {
        self.components.iter().find(|s| s.name == identifier)
    }
}

/// Parses `source` per the grammar above. Line numbers in error messages are 1-based.
pub fn parse(source: &str) -> Result<SystemConfig, ConfigError> {
    let mut system = Section { name: "System".to_string(), ..Default::default() };
    let mut components: Vec<Section> = Vec::new();
    let mut seen_sections: HashMap<String, usize> = HashMap::new();
    let mut current: Option<usize> = None; // index into components, or None for `system`
    let mut saw_any_section = false;

    for (line_number, raw_line) in source.lines().enumerate() {
        let line_number = line_number + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(stripped) = line.strip_prefix('[') {
            let Some(name) = stripped.strip_suffix(']') else {
                return Err(ConfigError::new(1, format!("malformed section header on line {line_number}")));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::new(4, format!("empty section name on line {line_number}")));
            }
            saw_any_section = true;
            if name == "System" {
                if seen_sections.contains_key("System") {
                    return Err(ConfigError::new(2, "duplicate [System] section".to_string()));
                }
                seen_sections.insert(name.to_string(), usize::MAX);
                current = None;
            } else {
                if seen_sections.contains_key(name) {
                    return Err(ConfigError::new(2, format!("duplicate section '{name}'")));
                }
                seen_sections.insert(name.to_string(), components.len());
                components.push(Section { name: name.to_string(), ..Default::default() });
                current = Some(components.len() - 1);
            }
            continue;
        }

        if !saw_any_section {
            return Err(ConfigError::new(
                3,
                format!("key=value on line {line_number} before any [Section] header"),
            ));
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::new(1, format!("malformed line {line_number} (expected key=value)")));
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if key.is_empty() {
            return Err(ConfigError::new(1, format!("empty key on line {line_number}")));
        }

        match current {
            None => system.insert(key, value),
            Some(index) => components[index].insert(key, value),
        }
    }

    Ok(SystemConfig { system, components })
}

impl fmt::Display for SystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[System]")?;
        for key in self.system.property_keys() {
            writeln!(f, "{key}={}", self.system.get(key).unwrap_or_default())?;
        }
        for component in &self.components {
            writeln!(f, "[{}]", component.name)?;
            for key in component.property_keys() {
                writeln!(f, "{key}={}", component.get(key).unwrap_or_default())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_and_component_sections() {
        let src = "\
; a comment
[System]
Type=isapc
RamSize=1048576

# another comment
[pic0]
Type=i8259-pic

[floppy0]
Type=floppy-drive
Path=boot.img
";
        let config = parse(src).unwrap();
        assert_eq!(config.system_type(), Some("isapc"));
        assert_eq!(config.system.get("RamSize"), Some("1048576"));
        assert_eq!(config.components.len(), 2);
        let floppy = config.component("floppy0").unwrap();
        assert_eq!(floppy.component_type(), Some("floppy-drive"));
        assert_eq!(floppy.get("Path"), Some("boot.img"));
        assert_eq!(floppy.property_keys().collect::<Vec<_>>(), vec!["Path"]);
    }

    #[test]
    fn blank_lines_and_comments_are_ignored_anywhere() {
        let src = "[System]\n\n;comment\nType=ibm-pc-at\n#also a comment\n\n";
        let config = parse(src).unwrap();
        assert_eq!(config.system_type(), Some("ibm-pc-at"));
    }

    #[test]
    fn key_value_before_any_section_is_rejected() {
        let err = parse("Type=isapc\n[System]\n").unwrap_err();
        assert_eq!(err.code, 3);
    }

    #[test]
    fn malformed_line_without_equals_is_rejected() {
        let err = parse("[System]\nThisIsNotKeyValue\n").unwrap_err();
        assert_eq!(err.code, 1);
    }

    #[test]
    fn duplicate_section_names_are_rejected() {
        let err = parse("[System]\nType=isapc\n[System]\nType=isapc\n").unwrap_err();
        assert_eq!(err.code, 2);
    }

    #[test]
    fn display_round_trips_back_into_parse() {
        let src = "[System]\nType=isapc\n[pic0]\nType=i8259-pic\n";
        let config = parse(src).unwrap();
        let rendered = config.to_string();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(reparsed.system_type(), config.system_type());
        assert_eq!(reparsed.components.len(), config.components.len());
    }
}
