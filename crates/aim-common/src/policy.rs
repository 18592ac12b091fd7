//! Pure, stateless input validators.
//!
//! Every function here is a contract gate: no I/O, no locks, no clock. The
//! wire-payload validator lives next to the codec in [`crate::wire`].

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::identity::{IDENTITY_ID_MIN_LEN, IDENTITY_ID_PREFIX};
use crate::models::{Direction, Message};

/// Literal consent token required for backup export, seed export, and wipe.
pub const BACKUP_CONSENT_TOKEN: &str = "I_UNDERSTAND_BACKUP_RISK";

/// Upper bound on `limit` for message listing.
pub const MAX_LIST_LIMIT: u32 = 1000;
/// Upper bound on `offset` for message listing.
pub const MAX_LIST_OFFSET: u32 = 1_000_000;

/// Check the shape of a contact / identity ID: `aim1` prefix, minimum length.
pub fn validate_contact_id(contact_id: &str) -> CoreResult<String> {
    let id = contact_id.trim();
    if id.is_empty() {
        return Err(CoreError::api("contact id is required"));
    }
    if !id.starts_with(IDENTITY_ID_PREFIX) || id.len() < IDENTITY_ID_MIN_LEN {
        return Err(CoreError::api(format!("malformed contact id: {id}")));
    }
    Ok(id.to_owned())
}

/// Validate a send-message request, returning the trimmed pair.
pub fn validate_send_message_input(contact_id: &str, content: &str) -> CoreResult<(String, String)> {
    let contact_id = validate_contact_id(contact_id)?;
    let content = content.trim();
    if content.is_empty() {
        return Err(CoreError::api("message content is required"));
    }
    Ok((contact_id, content.to_owned()))
}

/// Validate an edit-message request, returning the trimmed content.
pub fn validate_edit_message_input(
    contact_id: &str,
    message_id: &str,
    content: &str,
) -> CoreResult<(String, Uuid, String)> {
    let contact_id = validate_contact_id(contact_id)?;
    let message_id = message_id
        .trim()
        .parse::<Uuid>()
        .map_err(|_| CoreError::api("malformed message id"))?;
    let content = content.trim();
    if content.is_empty() {
        return Err(CoreError::api("message content is required"));
    }
    Ok((contact_id, message_id, content.to_owned()))
}

/// Gate an edit: the message must exist, belong to the contact, and be ours.
pub fn ensure_editable_message(
    msg: Option<&Message>,
    contact_id: &str,
) -> CoreResult<()> {
    let Some(msg) = msg else {
        return Err(CoreError::not_found("message"));
    };
    if msg.contact_id != contact_id {
        return Err(CoreError::WrongContact);
    }
    if msg.direction != Direction::Out {
        return Err(CoreError::NotOutbound);
    }
    Ok(())
}

/// Validate list-messages pagination bounds.
pub fn validate_list_messages_input(
    contact_id: &str,
    limit: u32,
    offset: u32,
) -> CoreResult<String> {
    let contact_id = validate_contact_id(contact_id)?;
    if limit > MAX_LIST_LIMIT {
        return Err(CoreError::api(format!("limit must be at most {MAX_LIST_LIMIT}")));
    }
    if offset > MAX_LIST_OFFSET {
        return Err(CoreError::api(format!(
            "offset must be at most {MAX_LIST_OFFSET}"
        )));
    }
    Ok(contact_id)
}

/// Exact-match check of the backup consent token (after trim).
pub fn is_backup_consent_token_valid(token: &str) -> bool {
    token.trim() == BACKUP_CONSENT_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, ConversationType, MessageStatus};
    use chrono::Utc;

    fn message(contact_id: &str, direction: Direction) -> Message {
        Message {
            id: Uuid::new_v4(),
            contact_id: contact_id.into(),
            conversation_id: contact_id.into(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"hello".to_vec(),
            content_type: ContentType::Text,
            direction,
            status: MessageStatus::Sent,
            edited: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn send_input_is_trimmed() {
        let (id, content) =
            validate_send_message_input("  aim1abcdefgh  ", "  hi there  ").unwrap();
        assert_eq!(id, "aim1abcdefgh");
        assert_eq!(content, "hi there");
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(validate_send_message_input("aim1abcdefgh", "   ").is_err());
        assert!(validate_send_message_input("   ", "hi").is_err());
    }

    #[test]
    fn contact_id_shape_is_enforced() {
        assert!(validate_contact_id("aim1abcdefgh").is_ok());
        assert!(validate_contact_id("bim1abcdefgh").is_err());
        assert!(validate_contact_id("aim1abc").is_err());
    }

    #[test]
    fn edit_requires_outbound_and_matching_contact() {
        let msg = message("aim1abcdefgh", Direction::In);
        let err = ensure_editable_message(Some(&msg), "aim1abcdefgh").unwrap_err();
        assert_eq!(err.to_string(), "only outbound messages can be edited");

        let msg = message("aim1abcdefgh", Direction::Out);
        let err = ensure_editable_message(Some(&msg), "aim1zzzzzzzz").unwrap_err();
        assert_eq!(err.to_string(), "message does not belong to contact");

        assert!(ensure_editable_message(Some(&msg), "aim1abcdefgh").is_ok());
        assert!(ensure_editable_message(None, "aim1abcdefgh").is_err());
    }

    #[test]
    fn list_bounds_are_enforced() {
        assert!(validate_list_messages_input("aim1abcdefgh", 1000, 0).is_ok());
        assert!(validate_list_messages_input("aim1abcdefgh", 1001, 0).is_err());
        assert!(validate_list_messages_input("aim1abcdefgh", 10, 1_000_001).is_err());
    }

    #[test]
    fn consent_token_is_exact_match_after_trim() {
        assert!(is_backup_consent_token_valid("I_UNDERSTAND_BACKUP_RISK"));
        assert!(is_backup_consent_token_valid("  I_UNDERSTAND_BACKUP_RISK\n"));
        assert!(!is_backup_consent_token_valid("i_understand_backup_risk"));
        assert!(!is_backup_consent_token_valid(""));
    }
}
