//! XML mapper format
//!
//! ```xml
//! <mapper id="..." name="Game Name" platform="NES">
//!   <memory>
//!     <read start="0x0000" end="0x07FF" />
//!   </memory>
//!   <properties>
//!     <group name="player">
//!       <property path="health" type="uint" address="0x0010" length="1" />
//!     </group>
//!   </properties>
//! </mapper>
//! ```

use std::borrow::Cow;
use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::property::{Endian, PropertySpec, PropertyType};
use super::{Mapper, MapperMetadata, PropertyGraph, ReadRange};
use crate::error::{Error, Result};
use crate::memory::MemoryAddress;
use crate::script;

/// Parse mapper markup plus its (already export-stripped) companion script.
pub fn parse_mapper(xml: &str, global_script: Option<String>) -> Result<Mapper> {
    let mut reader = Reader::from_str(xml);

    let mut metadata: Option<MapperMetadata> = None;
    let mut read_ranges = Vec::new();
    let mut specs = Vec::new();
    let mut groups: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::MapperParse(format!("at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => {
                let element = element_name(&e);
                handle_element(&element, &e, &mut metadata, &mut read_ranges, &mut specs, &groups)?;
                if element == "group" {
                    let attrs = attributes(&e)?;
                    groups.push(required(&attrs, "name", "group")?.to_string());
                }
            }
            Event::Empty(e) => {
                let element = element_name(&e);
                handle_element(&element, &e, &mut metadata, &mut read_ranges, &mut specs, &groups)?;
            }
            Event::End(e) => {
                if e.name().as_ref() == b"group" {
                    groups.pop();
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let metadata = metadata.ok_or_else(|| Error::MapperParse("missing <mapper> root".into()))?;

    let (has_global_preprocessor, has_global_postprocessor) = match &global_script {
        Some(source) => {
            let functions = script::declared_functions(source)?;
            (
                functions.iter().any(|f| f == script::PREPROCESSOR),
                functions.iter().any(|f| f == script::POSTPROCESSOR),
            )
        }
        None => (false, false),
    };

    Ok(Mapper {
        metadata,
        properties: PropertyGraph::new(specs)?,
        read_ranges,
        global_script,
        has_global_preprocessor,
        has_global_postprocessor,
    })
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn handle_element(
    element: &str,
    e: &BytesStart<'_>,
    metadata: &mut Option<MapperMetadata>,
    read_ranges: &mut Vec<ReadRange>,
    specs: &mut Vec<PropertySpec>,
    groups: &[String],
) -> Result<()> {
    match element {
        "mapper" => {
            let attrs = attributes(e)?;
            *metadata = Some(MapperMetadata {
                id: required(&attrs, "id", "mapper")?.to_string(),
                game_name: required(&attrs, "name", "mapper")?.to_string(),
                platform: required(&attrs, "platform", "mapper")?.to_string(),
            });
        }
        "read" => {
            let attrs = attributes(e)?;
            let start = parse_address(required(&attrs, "start", "read")?)?;
            let end = parse_address(required(&attrs, "end", "read")?)?;
            if end < start {
                return Err(Error::MapperParse(format!(
                    "read range end {:#x} is before start {:#x}",
                    end, start
                )));
            }
            read_ranges.push(ReadRange {
                start,
                end,
                namespace: attrs.get("namespace").cloned(),
            });
        }
        "property" => {
            let attrs = attributes(e)?;
            specs.push(parse_property(&attrs, groups)?);
        }
        _ => {}
    }
    Ok(())
}

fn parse_property(attrs: &HashMap<String, String>, groups: &[String]) -> Result<PropertySpec> {
    let name = required(attrs, "path", "property")?;
    let path = if groups.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", groups.join("."), name)
    };

    let kind = attrs
        .get("type")
        .map(|t| t.parse::<PropertyType>())
        .transpose()?
        .unwrap_or(PropertyType::Uint);

    let mut spec = PropertySpec::new(path, kind);
    spec.address = attrs.get("address").map(|a| parse_address(a)).transpose()?;
    if let Some(length) = attrs.get("length") {
        spec.length = parse_number(length)? as usize;
    }
    spec.bit = attrs
        .get("bit")
        .map(|b| parse_number(b).map(|n| n as u32))
        .transpose()?;
    spec.endian = match attrs.get("endian").map(String::as_str) {
        None | Some("little") => Endian::Little,
        Some("big") => Endian::Big,
        Some(other) => {
            return Err(Error::MapperParse(format!(
                "{}: unknown endian '{}'",
                spec.path, other
            )))
        }
    };
    spec.namespace = attrs.get("namespace").cloned();
    spec.read_condition = attrs.get("read-condition").cloned();
    spec.before_read = attrs.get("before-read").cloned();
    spec.after_read = attrs.get("after-read").cloned();

    if spec.length == 0 {
        return Err(Error::MapperParse(format!("{}: length must be at least 1", spec.path)));
    }
    if matches!(spec.kind, PropertyType::Uint | PropertyType::Int) && spec.length > 8 {
        return Err(Error::MapperParse(format!(
            "{}: integers are at most 8 bytes, got {}",
            spec.path, spec.length
        )));
    }

    Ok(spec)
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::MapperParse(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value: Cow<'_, str> = attr
            .unescape_value()
            .map_err(|err| Error::MapperParse(err.to_string()))?;
        attrs.insert(key, value.into_owned());
    }
    Ok(attrs)
}

fn required<'a>(attrs: &'a HashMap<String, String>, key: &str, element: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::MapperParse(format!("<{}> is missing the '{}' attribute", element, key)))
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| Error::MapperParse(format!("'{}' is not a number", s)))
}

fn parse_address(s: &str) -> Result<MemoryAddress> {
    let n = parse_number(s)?;
    MemoryAddress::try_from(n)
        .map_err(|_| Error::MapperParse(format!("address {:#x} does not fit in 32 bits", n)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTH_MAPPER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<mapper id="6a1f" name="Test Quest" platform="NES">
  <memory>
    <read start="0x0000" end="0x00FF" />
  </memory>
  <properties>
    <property path="health" type="uint" address="0x0010" length="1" />
  </properties>
</mapper>"#;

    #[test]
    fn test_parse_basic_mapper() {
        let mapper = parse_mapper(HEALTH_MAPPER, None).unwrap();

        assert_eq!(mapper.metadata.id, "6a1f");
        assert_eq!(mapper.metadata.game_name, "Test Quest");
        assert_eq!(mapper.metadata.platform, "NES");
        assert_eq!(
            mapper.read_ranges,
            vec![ReadRange {
                start: 0,
                end: 0xFF,
                namespace: None
            }]
        );
        assert_eq!(mapper.properties.len(), 1);

        let health = mapper.properties.snapshot("health").unwrap();
        assert_eq!(health.address, Some(0x10));
        assert_eq!(health.length, 1);
        assert!(!mapper.has_global_preprocessor);
        assert!(!mapper.has_global_postprocessor);
    }

    #[test]
    fn test_groups_prefix_paths() {
        let xml = r#"<mapper id="x" name="X" platform="GBA">
  <properties>
    <group name="player">
      <group name="stats">
        <property path="hp" address="0x02000000" length="2" endian="big" />
      </group>
      <property path="name" type="string" address="0x02000010" length="8" />
    </group>
    <property path="frame" address="4" />
  </properties>
</mapper>"#;
        let mapper = parse_mapper(xml, None).unwrap();

        assert!(mapper.properties.get("player.stats.hp").is_some());
        assert!(mapper.properties.get("player.name").is_some());
        assert!(mapper.properties.get("frame").is_some());
        assert!(mapper.read_ranges.is_empty());
    }

    #[test]
    fn test_hooks_and_namespaces() {
        let xml = r#"<mapper id="x" name="X" platform="GB">
  <properties>
    <property path="p" type="bit" bit="3" address="0x10" namespace="decrypted"
              read-condition="is_ready" before-read="decrypt" after-read="x &gt; 0" />
  </properties>
</mapper>"#;
        let mapper = parse_mapper(xml, None).unwrap();
        let property = mapper.properties.get("p").unwrap();
        let property = crate::mapper::property::lock(property);
        let spec = property.spec();

        assert_eq!(spec.kind, PropertyType::Bit);
        assert_eq!(spec.bit, Some(3));
        assert_eq!(spec.namespace.as_deref(), Some("decrypted"));
        assert_eq!(spec.read_condition.as_deref(), Some("is_ready"));
        assert_eq!(spec.before_read.as_deref(), Some("decrypt"));
        assert_eq!(spec.after_read.as_deref(), Some("x > 0"));
    }

    #[test]
    fn test_detects_entry_points() {
        let script = "fn preprocessor() { true }\nfn postprocessor() { }".to_string();
        let mapper = parse_mapper(HEALTH_MAPPER, Some(script)).unwrap();
        assert!(mapper.has_global_preprocessor);
        assert!(mapper.has_global_postprocessor);
    }

    #[test]
    fn test_rejects_bad_markup() {
        assert!(matches!(
            parse_mapper("<properties />", None),
            Err(Error::MapperParse(_))
        ));

        let bad_type = r#"<mapper id="x" name="X" platform="GB"><properties>
            <property path="a" type="float" address="1" /></properties></mapper>"#;
        assert!(matches!(parse_mapper(bad_type, None), Err(Error::MapperParse(_))));

        let inverted = r#"<mapper id="x" name="X" platform="GB"><memory>
            <read start="0x10" end="0x01" /></memory></mapper>"#;
        assert!(matches!(parse_mapper(inverted, None), Err(Error::MapperParse(_))));

        let duplicate = r#"<mapper id="x" name="X" platform="GB"><properties>
            <property path="a" address="1" /><property path="a" address="2" /></properties></mapper>"#;
        assert!(matches!(parse_mapper(duplicate, None), Err(Error::MapperParse(_))));
    }

    #[test]
    fn test_script_syntax_error_is_reported() {
        let err = parse_mapper(HEALTH_MAPPER, Some("fn preprocessor( {".into())).unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn test_parse_number_formats() {
        assert_eq!(parse_number("16").unwrap(), 16);
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number(" 0XfF ").unwrap(), 255);
        assert!(parse_number("ten").is_err());
        assert!(parse_address("0x100000000").is_err());
    }
}
