//! Recipient address validation using mailparse.

use mailparse::addrparse;

use crate::error::ValidationError;

/// Validate that `raw` is exactly one mailbox of the shape `local@domain`.
///
/// Display-name forms such as `Bob <bob@example.com>` are accepted; groups
/// and address lists are not. Returns the bare address on success.
pub fn validate_recipient(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyRecipient);
    }

    let malformed = || ValidationError::MalformedRecipient(trimmed.to_string());

    let list = addrparse(trimmed).map_err(|_| malformed())?;
    let single = list.extract_single_info().ok_or_else(malformed)?;

    let (local, domain) = single.addr.rsplit_once('@').ok_or_else(malformed)?;
    if local.is_empty()
        || domain.is_empty()
        || domain.starts_with('.')
        || domain.ends_with('.')
        || single.addr.chars().any(char::is_whitespace)
    {
        return Err(malformed());
    }

    Ok(single.addr)
}
