//! Minimal XML extraction for the network scan protocol
//!
//! Scanner firmwares disagree on namespace prefixes and formatting, so the
//! parsing here is deliberately loose: find the tag with or without a
//! prefix, take the text between the brackets. No document model needed for
//! the handful of fields the backend reads.

/// Extract the first text value of `tag`, namespace-prefix agnostic
pub fn extract_value(xml: &str, tag: &str) -> Option<String> {
    let patterns = [format!("<{}>", tag), format!(":{}>", tag)];

    for pattern in &patterns {
        if let Some(start) = xml.find(pattern.as_str()) {
            let after = &xml[start + pattern.len()..];
            if let Some(end) = after.find('<') {
                let value = after[..end].trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Collect every text value of `tag`, namespace-prefix agnostic
pub fn collect_values(xml: &str, tag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let patterns = [format!("<{}>", tag), format!(":{}>", tag)];

    for pattern in &patterns {
        let mut rest = xml;
        while let Some(start) = rest.find(pattern.as_str()) {
            let after = &rest[start + pattern.len()..];
            if let Some(end) = after.find('<') {
                let value = after[..end].trim();
                if !value.is_empty() && !values.iter().any(|v| v == value) {
                    values.push(value.to_string());
                }
                rest = &after[end..];
            } else {
                break;
            }
        }
    }
    values
}

/// True when `tag` opens anywhere in the document, prefixed or not
pub fn has_section(xml: &str, tag: &str) -> bool {
    xml.contains(&format!("<{}", tag)) || xml.contains(&format!(":{}", tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.63</pwg:Version>
  <pwg:MakeAndModel>ACME ScanJet 9000</pwg:MakeAndModel>
  <scan:Platen>
    <scan:PlatenInputCaps>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>RGB24</scan:ColorMode>
            <scan:ColorMode>Grayscale8</scan:ColorMode>
          </scan:ColorModes>
          <scan:SupportedResolutions>
            <scan:DiscreteResolutions>
              <scan:DiscreteResolution>
                <scan:XResolution>200</scan:XResolution>
                <scan:YResolution>200</scan:YResolution>
              </scan:DiscreteResolution>
              <scan:DiscreteResolution>
                <scan:XResolution>300</scan:XResolution>
                <scan:YResolution>300</scan:YResolution>
              </scan:DiscreteResolution>
            </scan:DiscreteResolutions>
          </scan:SupportedResolutions>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:PlatenInputCaps>
  </scan:Platen>
  <scan:Adf>
    <scan:AdfSimplexInputCaps/>
    <scan:AdfDuplexInputCaps/>
  </scan:Adf>
</scan:ScannerCapabilities>"#;

    #[test]
    fn extracts_prefixed_values() {
        assert_eq!(
            extract_value(CAPS, "MakeAndModel").as_deref(),
            Some("ACME ScanJet 9000")
        );
        assert_eq!(extract_value(CAPS, "Version").as_deref(), Some("2.63"));
        assert!(extract_value(CAPS, "SerialNumber").is_none());
    }

    #[test]
    fn collects_repeated_values_without_duplicates() {
        assert_eq!(collect_values(CAPS, "ColorMode"), vec!["RGB24", "Grayscale8"]);
        assert_eq!(collect_values(CAPS, "XResolution"), vec!["200", "300"]);
    }

    #[test]
    fn detects_sections() {
        assert!(has_section(CAPS, "Adf"));
        assert!(has_section(CAPS, "AdfDuplexInputCaps"));
        assert!(!has_section(CAPS, "Camera"));
    }

    #[test]
    fn extracts_unprefixed_values() {
        let xml = "<Root><Name>plain</Name></Root>";
        assert_eq!(extract_value(xml, "Name").as_deref(), Some("plain"));
    }
}
