//! Presence values and NOTIFY body decoding

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a monitored extension is doing, as shown on a BLF key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PresenceValue {
    Available,
    Ringing,
    Busy,
    OnHold,
    #[default]
    Unknown,
}

impl PresenceValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceValue::Available => "available",
            PresenceValue::Ringing => "ringing",
            PresenceValue::Busy => "busy",
            PresenceValue::OnHold => "on-hold",
            PresenceValue::Unknown => "unknown",
        }
    }

    /// Decode a NOTIFY body
    ///
    /// Accepts dialog-info XML, PIDF, or a bare state token. Anything that
    /// cannot be interpreted decodes to [`PresenceValue::Unknown`].
    pub fn from_notification(body: &str) -> Self {
        let body = body.trim();
        if body.is_empty() {
            return PresenceValue::Unknown;
        }
        if body.starts_with('<') {
            return match parse_xml(body) {
                Ok(value) => value,
                Err(reason) => {
                    debug!(reason = %reason, "Undecodable presence body");
                    PresenceValue::Unknown
                }
            };
        }
        Self::from_token(body)
    }

    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "available" | "idle" | "ready" | "open" | "terminated" => PresenceValue::Available,
            "ringing" | "early" => PresenceValue::Ringing,
            "busy" | "confirmed" | "in-use" => PresenceValue::Busy,
            "hold" | "onhold" | "on-hold" | "on hold" => PresenceValue::OnHold,
            _ => PresenceValue::Unknown,
        }
    }
}

impl fmt::Display for PresenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct DialogEntry {
    state: String,
    rendering_off: bool,
}

#[derive(Default)]
struct DialogInfo {
    dialogs: Vec<DialogEntry>,
}

impl DialogInfo {
    fn value(&self) -> PresenceValue {
        let mut value = PresenceValue::Available;
        for dialog in &self.dialogs {
            let candidate = match dialog.state.as_str() {
                "early" | "trying" | "proceeding" => PresenceValue::Ringing,
                "confirmed" if dialog.rendering_off => PresenceValue::OnHold,
                "confirmed" => PresenceValue::Busy,
                _ => PresenceValue::Available,
            };
            if rank(candidate) > rank(value) {
                value = candidate;
            }
        }
        value
    }
}

/// Priority when several dialogs are reported at once
fn rank(value: PresenceValue) -> u8 {
    match value {
        PresenceValue::Ringing => 4,
        PresenceValue::Busy => 3,
        PresenceValue::OnHold => 2,
        PresenceValue::Available => 1,
        PresenceValue::Unknown => 0,
    }
}

#[derive(Default)]
struct PidfInfo {
    basic: Option<String>,
    notes: Vec<String>,
    activities: Vec<String>,
}

impl PidfInfo {
    fn value(&self) -> PresenceValue {
        for note in &self.notes {
            let note = note.to_ascii_lowercase();
            let value = match note.as_str() {
                "ready" | "available" | "online" | "idle" => PresenceValue::Available,
                "ringing" => PresenceValue::Ringing,
                "on the phone" | "busy" | "in a call" => PresenceValue::Busy,
                "on hold" => PresenceValue::OnHold,
                _ => PresenceValue::Unknown,
            };
            if value != PresenceValue::Unknown {
                return value;
            }
        }

        if self
            .activities
            .iter()
            .any(|activity| matches!(activity.as_str(), "on-the-phone" | "busy"))
        {
            return PresenceValue::Busy;
        }

        match self.basic.as_deref() {
            Some("open") => PresenceValue::Available,
            _ => PresenceValue::Unknown,
        }
    }
}

enum Document {
    Unrecognized,
    DialogInfo(DialogInfo),
    Pidf(PidfInfo),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    None,
    DialogState,
    Basic,
    Note,
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn is_rendering_off(element: &BytesStart<'_>) -> bool {
    let mut name = None;
    let mut value = None;
    for attr in element.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"pname" => name = Some(String::from_utf8_lossy(&attr.value).into_owned()),
            b"pvalue" => value = Some(String::from_utf8_lossy(&attr.value).into_owned()),
            _ => {}
        }
    }
    name.as_deref() == Some("+sip.rendering") && value.as_deref() == Some("no")
}

fn parse_xml(body: &str) -> Result<PresenceValue, String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut document = Document::Unrecognized;
    let mut current_dialog: Option<DialogEntry> = None;
    let mut in_activities = false;
    let mut text_target = TextTarget::None;
    let mut buf = Vec::new();
    let mut root_seen = false;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| e.to_string())?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = local_name(e);
                let is_start = matches!(event, Event::Start(_));

                if is_start {
                    depth += 1;
                }

                if !root_seen {
                    root_seen = true;
                    document = match name.as_str() {
                        "dialog-info" => Document::DialogInfo(DialogInfo::default()),
                        "presence" => Document::Pidf(PidfInfo::default()),
                        _ => return Ok(PresenceValue::Unknown),
                    };
                } else {
                    match &mut document {
                        Document::DialogInfo(info) => match name.as_str() {
                            "dialog" if is_start => current_dialog = Some(DialogEntry::default()),
                            "dialog" => info.dialogs.push(DialogEntry::default()),
                            "state" if is_start && current_dialog.is_some() => text_target = TextTarget::DialogState,
                            "param" if is_rendering_off(e) => {
                                if let Some(dialog) = current_dialog.as_mut() {
                                    dialog.rendering_off = true;
                                }
                            }
                            _ => {}
                        },
                        Document::Pidf(info) => match name.as_str() {
                            "basic" if is_start => text_target = TextTarget::Basic,
                            "note" if is_start => text_target = TextTarget::Note,
                            "activities" if is_start => in_activities = true,
                            _ if in_activities => info.activities.push(name.clone()),
                            _ => {}
                        },
                        Document::Unrecognized => {}
                    }
                }
            }
            Event::Text(ref e) => {
                let text = e.unescape().map_err(|err| err.to_string())?.trim().to_string();
                match (&mut document, text_target) {
                    (Document::DialogInfo(_), TextTarget::DialogState) => {
                        if let Some(dialog) = current_dialog.as_mut() {
                            dialog.state = text.to_ascii_lowercase();
                        }
                    }
                    (Document::Pidf(info), TextTarget::Basic) => info.basic = Some(text.to_ascii_lowercase()),
                    (Document::Pidf(info), TextTarget::Note) => info.notes.push(text),
                    _ => {}
                }
                text_target = TextTarget::None;
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match (&mut document, name.as_str()) {
                    (Document::DialogInfo(info), "dialog") => {
                        if let Some(dialog) = current_dialog.take() {
                            info.dialogs.push(dialog);
                        }
                    }
                    (Document::Pidf(_), "activities") => in_activities = false,
                    _ => {}
                }
                text_target = TextTarget::None;
            }
            Event::Eof if depth > 0 => return Err("unclosed element".to_string()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(match document {
        Document::DialogInfo(info) => info.value(),
        Document::Pidf(info) => info.value(),
        Document::Unrecognized => PresenceValue::Unknown,
    })
}
