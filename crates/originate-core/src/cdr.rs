//! XML call detail records for failed legs

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::channel::Channel;
use crate::errors::{OriginateError, Result};

/// Renders a channel into an XML CDR blob.
pub trait CdrGenerator: Send + Sync {
    fn generate_xml_cdr(&self, channel: &dyn Channel) -> Result<String>;
}

/// Default generator: channel data, variables and caller profile.
#[derive(Debug, Default)]
pub struct XmlCdrGenerator;

fn xml_err(e: impl std::fmt::Display) -> OriginateError {
    OriginateError::Cdr(e.to_string())
}

fn text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesStart::new(name).to_end()))
        .map_err(xml_err)?;
    Ok(())
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

impl CdrGenerator for XmlCdrGenerator {
    fn generate_xml_cdr(&self, channel: &dyn Channel) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let snapshot = channel.snapshot();

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut cdr = BytesStart::new("cdr");
        cdr.push_attribute(("uuid", channel.uuid()));
        writer.write_event(Event::Start(cdr)).map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("channel_data")))
            .map_err(xml_err)?;
        text_element(&mut writer, "name", channel.name())?;
        text_element(&mut writer, "state", &snapshot.state.to_string())?;
        text_element(
            &mut writer,
            "direction",
            match channel.direction() {
                crate::types::CallDirection::Inbound => "inbound",
                crate::types::CallDirection::Outbound => "outbound",
            },
        )?;
        text_element(&mut writer, "hangup_cause", snapshot.cause.as_str())?;
        text_element(&mut writer, "hangup_cause_q850", &snapshot.cause.code().to_string())?;
        writer
            .write_event(Event::End(BytesStart::new("channel_data").to_end()))
            .map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("variables")))
            .map_err(xml_err)?;
        for (name, value) in channel.variables() {
            if is_xml_name(&name) {
                text_element(&mut writer, &name, &value)?;
            }
        }
        writer
            .write_event(Event::End(BytesStart::new("variables").to_end()))
            .map_err(xml_err)?;

        if let Some(profile) = channel.caller_profile() {
            writer
                .write_event(Event::Start(BytesStart::new("caller_profile")))
                .map_err(xml_err)?;
            text_element(&mut writer, "caller_id_name", &profile.caller_id_name)?;
            text_element(&mut writer, "caller_id_number", &profile.caller_id_number)?;
            text_element(&mut writer, "destination_number", &profile.destination_number)?;
            text_element(&mut writer, "context", &profile.context)?;
            text_element(&mut writer, "created_time", &profile.created.timestamp_micros().to_string())?;
            writer
                .write_event(Event::End(BytesStart::new("caller_profile").to_end()))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesStart::new("cdr").to_end()))
            .map_err(xml_err)?;

        let xml = writer.into_inner().into_inner();
        String::from_utf8(xml).map_err(xml_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackChannel;
    use crate::types::CauseCode;

    #[test]
    fn test_cdr_contains_cause_and_escaped_variables() {
        let channel = LoopbackChannel::new("loopback/cdr");
        channel.set_variable("note", Some("a<b & c"));
        channel.set_variable("bad name", Some("skipped"));
        channel.hangup(CauseCode::UserBusy);

        let xml = XmlCdrGenerator.generate_xml_cdr(channel.as_ref()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<hangup_cause>USER_BUSY</hangup_cause>"));
        assert!(xml.contains("<hangup_cause_q850>17</hangup_cause_q850>"));
        assert!(xml.contains("<note>a&lt;b &amp; c</note>"));
        assert!(!xml.contains("skipped"));
    }

    #[test]
    fn test_xml_name_filter() {
        assert!(is_xml_name("sip_to_user"));
        assert!(is_xml_name("_x-1.y"));
        assert!(!is_xml_name("1abc"));
        assert!(!is_xml_name("a b"));
        assert!(!is_xml_name(""));
    }
}
