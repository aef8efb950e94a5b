//! Vendor wire codec
//!
//! The dispatch network speaks a flat XML protocol. Request and response
//! roots follow a strict naming convention: a `{Name}Request` from one side
//! is answered by a `{Name}Response` from the other, with the outcome inside
//! a `Result` element (`Success`, and `FailureReason`/`FailureCode` on
//! failure). That convention is part of the wire contract.
//!
//! Decoding produces a typed tree ([`XmlNode`]) and then typed values; the
//! vendor's habit of collapsing single-element lists is absorbed here by
//! `children(name)` returning however many matched. Nothing outside this
//! module probes loose payload shapes.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::domain::events::{VendorEvent, VendorEventKind};
use crate::domain::money::normalize_to_minor_units;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("unexpected root element: expected {expected}, got {got}")]
    UnexpectedRoot { expected: String, got: String },
}

/// A decoded XML element: name, concatenated text, child elements in
/// document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn element(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::element(name).with_text(text)
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given name. A collapsed single element
    /// and a proper list look the same to callers.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first matching element anywhere beneath this node
    /// (depth-first). Vendor payloads nest inconsistently, so lookups are
    /// tolerant of depth.
    pub fn find_text(&self, name: &str) -> Option<&str> {
        if self.name == name && !self.text.is_empty() {
            return Some(self.text.as_str());
        }
        self.children.iter().find_map(|c| c.find_text(name))
    }

    /// Render this node as an XML document fragment.
    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        // Writing into a Vec cannot fail
        let _ = write_node(&mut writer, self);
        String::from_utf8(writer.into_inner()).unwrap_or_default()
    }

    /// Convert to JSON for archiving in the audit trail.
    pub fn to_json(&self) -> serde_json::Value {
        if self.children.is_empty() {
            return serde_json::Value::String(self.text.clone());
        }
        let mut map = serde_json::Map::new();
        for child in &self.children {
            let value = child.to_json();
            match map.get_mut(&child.name) {
                None => {
                    map.insert(child.name.clone(), value);
                }
                Some(serde_json::Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = serde_json::Value::Array(vec![first, value]);
                }
            }
        }
        serde_json::Value::Object(map)
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) -> quick_xml::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(node.name.as_str())))?;
    if !node.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(node.text.as_str())))?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(node.name.as_str())))?;
    Ok(())
}

/// Parse an XML document into a node tree.
pub fn parse_document(xml: &str) -> Result<XmlNode, CodecError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(XmlNode::element(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                attach(&mut stack, &mut root, XmlNode::element(name))?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(c.into_inner().as_ref()));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| CodecError::Malformed("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {} // declarations, comments, processing instructions
            Err(e) => return Err(CodecError::Malformed(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(CodecError::Malformed("unclosed element".into()));
    }
    root.ok_or_else(|| CodecError::Malformed("empty document".into()))
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), CodecError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(CodecError::Malformed(
            "multiple root elements".into(),
        )),
    }
}

/// Decode an inbound webhook body into a typed event.
///
/// The root element must be `{event_name}Request`. Reference extraction is
/// tolerant: missing references produce `None`, never an error, because the
/// event is archived regardless of whether it can be matched to a ride.
pub fn decode_event(event_name: &str, body: &str) -> Result<VendorEvent, CodecError> {
    let kind = VendorEventKind::from_event_name(event_name)
        .ok_or_else(|| CodecError::UnknownEvent(event_name.to_string()))?;

    let doc = parse_document(body)?;
    let expected = format!("{event_name}Request");
    if doc.name != expected {
        return Err(CodecError::UnexpectedRoot {
            expected,
            got: doc.name,
        });
    }

    let final_fare = doc
        .find_text("FinalFare")
        .and_then(|v| v.parse::<f64>().ok())
        .map(normalize_to_minor_units);

    Ok(VendorEvent {
        kind,
        authorization_reference: doc
            .find_text("AuthorizationReference")
            .map(str::to_string),
        booking_reference: doc
            .find_text("AgentBookingReference")
            .or_else(|| doc.find_text("BookingReference"))
            .map(str::to_string),
        final_fare,
        cancellation_reason: doc
            .find_text("CancellationReason")
            .or_else(|| doc.find_text("Reason"))
            .map(str::to_string),
        vehicle_registration: doc.find_text("VehicleRegistration").map(str::to_string),
        driver_name: doc.find_text("DriverName").map(str::to_string),
        raw: doc.to_json(),
    })
}

/// Build the XML acknowledgement for a webhook event. Mirrors the request
/// root with the `Response` suffix; business failures ride inside the
/// `Result` element, never the HTTP status.
pub fn encode_event_ack(
    event_name: &str,
    success: bool,
    failure_reason: Option<&str>,
    failure_code: Option<&str>,
) -> String {
    let mut result = XmlNode::element("Result").with_child(XmlNode::leaf(
        "Success",
        if success { "true" } else { "false" },
    ));
    if let Some(reason) = failure_reason {
        result = result.with_child(XmlNode::leaf("FailureReason", reason));
    }
    if let Some(code) = failure_code {
        result = result.with_child(XmlNode::leaf("FailureCode", code));
    }

    XmlNode::element(format!("{event_name}Response"))
        .with_child(result)
        .to_xml()
}

/// Read the `Result` element of a vendor response: `Ok(())` on success,
/// `Err(reason)` on a structured failure.
pub fn read_result(doc: &XmlNode) -> Result<(), String> {
    let success = doc
        .find_text("Success")
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if success {
        return Ok(());
    }
    let reason = doc
        .find_text("FailureReason")
        .unwrap_or("vendor reported failure without a reason");
    let code = doc.find_text("FailureCode");
    match code {
        Some(code) => Err(format!("{reason} (code {code})")),
        None => Err(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Pence;

    #[test]
    fn decodes_a_completion_event() {
        let body = r#"
            <AgentBookingCompletedEventRequest>
                <AuthorizationReference>AUTH-42</AuthorizationReference>
                <AgentBookingReference>RB-20250101-ABCDEF</AgentBookingReference>
                <FinalFare>2000</FinalFare>
            </AgentBookingCompletedEventRequest>"#;

        let event = decode_event("AgentBookingCompletedEvent", body).unwrap();
        assert_eq!(event.kind, VendorEventKind::Completed);
        assert_eq!(event.authorization_reference.as_deref(), Some("AUTH-42"));
        assert_eq!(
            event.booking_reference.as_deref(),
            Some("RB-20250101-ABCDEF")
        );
        assert_eq!(event.final_fare, Some(Pence(2000)));
    }

    #[test]
    fn missing_references_are_not_fatal() {
        let body = "<AgentBookingDispatchedEventRequest><Junk>x</Junk></AgentBookingDispatchedEventRequest>";
        let event = decode_event("AgentBookingDispatchedEvent", body).unwrap();
        assert!(event.authorization_reference.is_none());
        assert!(event.booking_reference.is_none());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let err = decode_event("AgentMadeUpEvent", "<AgentMadeUpEventRequest/>").unwrap_err();
        assert!(matches!(err, CodecError::UnknownEvent(_)));
    }

    #[test]
    fn mismatched_root_is_rejected() {
        let err =
            decode_event("AgentBookingDispatchedEvent", "<SomethingElse/>").unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedRoot { .. }));
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(decode_event("AgentBookingDispatchedEvent", "<unclosed>").is_err());
        assert!(decode_event("AgentBookingDispatchedEvent", "not xml at all").is_err());
    }

    #[test]
    fn ack_mirrors_request_name_and_carries_result() {
        let ack = encode_event_ack("AgentBookingCompletedEvent", true, None, None);
        assert!(ack.starts_with("<AgentBookingCompletedEventResponse>"));
        assert!(ack.contains("<Success>true</Success>"));
        assert!(ack.ends_with("</AgentBookingCompletedEventResponse>"));

        let nack = encode_event_ack(
            "AgentBookingCompletedEvent",
            false,
            Some("no matching booking"),
            Some("404"),
        );
        assert!(nack.contains("<Success>false</Success>"));
        assert!(nack.contains("<FailureReason>no matching booking</FailureReason>"));
        assert!(nack.contains("<FailureCode>404</FailureCode>"));
    }

    #[test]
    fn single_element_lists_collapse_transparently() {
        let one = parse_document(
            "<BidsResponse><Bids><Bid><VendorId>v1</VendorId></Bid></Bids></BidsResponse>",
        )
        .unwrap();
        let many = parse_document(
            "<BidsResponse><Bids><Bid><VendorId>v1</VendorId></Bid><Bid><VendorId>v2</VendorId></Bid></Bids></BidsResponse>",
        )
        .unwrap();

        let count = |doc: &XmlNode| {
            doc.child("Bids")
                .map(|b| b.children_named("Bid").count())
                .unwrap_or(0)
        };
        assert_eq!(count(&one), 1);
        assert_eq!(count(&many), 2);
    }

    #[test]
    fn result_element_reads_success_and_failure() {
        let ok = parse_document(
            "<XResponse><Result><Success>true</Success></Result></XResponse>",
        )
        .unwrap();
        assert!(read_result(&ok).is_ok());

        let failed = parse_document(
            "<XResponse><Result><Success>false</Success><FailureReason>no cars</FailureReason><FailureCode>12</FailureCode></Result></XResponse>",
        )
        .unwrap();
        let err = read_result(&failed).unwrap_err();
        assert!(err.contains("no cars"));
        assert!(err.contains("12"));
    }

    #[test]
    fn repeated_elements_become_json_arrays() {
        let doc = parse_document("<R><Item>a</Item><Item>b</Item><Other>c</Other></R>").unwrap();
        let json = doc.to_json();
        assert_eq!(json["Item"], serde_json::json!(["a", "b"]));
        assert_eq!(json["Other"], serde_json::json!("c"));
    }
}
