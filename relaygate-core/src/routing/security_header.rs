//! Relay of the processed WS-Security header block.
//!
//! A SOAP message carries at most one `Security` block per actor. The block
//! the gateway processed (recorded in the request's [`SecurityFacet`], the
//! default block when no facet is attached) may hold material meaningful
//! only to the local hop, so the routing node decides what the backend sees.

use tracing::debug;

use crate::message::{ContentType, Message, MessageError, SecurityFacet, SoapDocument};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecurityHeaderAction {
    /// Forward unchanged.
    #[default]
    Leave,
    /// Drop the processed block.
    Remove,
    /// Keep the processed block, minus its actor and mustUnderstand markers.
    Clean,
    /// Make the block addressed to `actor` the default block, replacing any
    /// existing default block.
    Promote { actor: String },
}

impl SecurityHeaderAction {
    /// Parse a config action name. `promote` needs an actor.
    pub fn parse(action: &str, actor: Option<&str>) -> Option<Self> {
        match action.to_ascii_lowercase().as_str() {
            "leave" | "none" => Some(Self::Leave),
            "remove" => Some(Self::Remove),
            "clean" | "cleanup" => Some(Self::Clean),
            "promote" => actor.map(|a| Self::Promote {
                actor: a.to_string(),
            }),
            _ => None,
        }
    }

    /// Rewrite `message` in place. Non-SOAP and streamed bodies are left
    /// alone; a missing block is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] when the body cannot be read or parsed.
    pub fn apply(&self, message: &mut Message) -> Result<(), MessageError> {
        if *self == Self::Leave || message.is_buffering_disallowed() || !message.is_soap() {
            return Ok(());
        }

        let processed_actor = message
            .facet::<SecurityFacet>()
            .and_then(|f| f.processed_actor.clone());
        let content_type = message.content_type().cloned().unwrap_or_else(ContentType::xml);

        let rewritten = {
            let doc = message.xml()?;
            match self {
                Self::Leave => None,
                Self::Remove => doc
                    .find_security_block(processed_actor.as_deref())
                    .and_then(|i| doc.without_security_block(i)),
                Self::Clean => doc
                    .find_security_block(processed_actor.as_deref())
                    .and_then(|i| doc.with_block_unaddressed(i)),
                Self::Promote { actor } => promote(doc, actor)?,
            }
        };

        match rewritten {
            Some(text) => {
                debug!(action = ?self, "Security header rewritten");
                message.initialize(content_type, text);
            }
            None => debug!(action = ?self, actor = ?processed_actor, "No matching security block"),
        }
        Ok(())
    }
}

/// Remove the current default block (if any), then unaddress the block for
/// `actor` in the re-parsed text.
fn promote(doc: &SoapDocument, actor: &str) -> Result<Option<String>, MessageError> {
    if doc.find_security_block(Some(actor)).is_none() {
        return Ok(None);
    }
    let without_default = match doc.find_security_block(None) {
        Some(i) => match doc.without_security_block(i) {
            Some(text) => SoapDocument::parse(text.as_bytes())?,
            None => return Ok(None),
        },
        None => doc.clone(),
    };
    Ok(without_default
        .find_security_block(Some(actor))
        .and_then(|i| without_default.with_block_unaddressed(i)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
    const WSSE_NS: &str =
        "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

    fn envelope(header: &str) -> Message {
        let body = format!(
            "<s:Envelope xmlns:s=\"{SOAP_NS}\" xmlns:wsse=\"{WSSE_NS}\">\
             <s:Header>{header}</s:Header><s:Body><ping/></s:Body></s:Envelope>"
        );
        Message::with_body(ContentType::xml(), body)
    }

    fn blocks(message: &mut Message) -> Vec<(Option<String>, bool)> {
        message
            .xml()
            .unwrap()
            .security_blocks()
            .iter()
            .map(|b| (b.actor.clone(), b.must_understand))
            .collect()
    }

    #[test]
    fn parse_names() {
        assert_eq!(SecurityHeaderAction::parse("remove", None), Some(SecurityHeaderAction::Remove));
        assert_eq!(SecurityHeaderAction::parse("promote", None), None);
        assert_eq!(
            SecurityHeaderAction::parse("promote", Some("backend")),
            Some(SecurityHeaderAction::Promote {
                actor: "backend".into()
            })
        );
        assert_eq!(SecurityHeaderAction::parse("shred", None), None);
    }

    #[test]
    fn remove_drops_default_block() {
        let mut message = envelope("<wsse:Security><t/></wsse:Security>");
        SecurityHeaderAction::Remove.apply(&mut message).unwrap();
        assert!(blocks(&mut message).is_empty());
    }

    #[test]
    fn remove_targets_processed_actor() {
        let mut message = envelope(
            "<wsse:Security><a/></wsse:Security>\
             <wsse:Security s:actor=\"gateway\"><b/></wsse:Security>",
        );
        message
            .attach(SecurityFacet {
                processed_actor: Some("gateway".into()),
            })
            .unwrap();
        SecurityHeaderAction::Remove.apply(&mut message).unwrap();
        assert_eq!(blocks(&mut message), vec![(None, false)]);
    }

    #[test]
    fn clean_strips_addressing() {
        let mut message = envelope(
            "<wsse:Security s:mustUnderstand=\"1\"><t/></wsse:Security>",
        );
        SecurityHeaderAction::Clean.apply(&mut message).unwrap();
        assert_eq!(blocks(&mut message), vec![(None, false)]);
    }

    #[test]
    fn promote_replaces_default_block() {
        let mut message = envelope(
            "<wsse:Security><old/></wsse:Security>\
             <wsse:Security s:actor=\"backend\"><new/></wsse:Security>",
        );
        SecurityHeaderAction::Promote {
            actor: "backend".into(),
        }
        .apply(&mut message)
        .unwrap();

        assert_eq!(blocks(&mut message), vec![(None, false)]);
        let text = message.body_text().unwrap();
        assert!(text.contains("<new/>"));
        assert!(!text.contains("<old/>"));
    }

    #[test]
    fn non_soap_body_untouched() {
        let mut message = Message::with_body(ContentType::json(), "{\"a\":1}");
        SecurityHeaderAction::Remove.apply(&mut message).unwrap();
        assert_eq!(message.body_text().unwrap(), "{\"a\":1}");
    }
}
