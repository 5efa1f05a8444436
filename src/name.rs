//! Display labels and name-group bucketing.

use crate::contact::Contact;
use crate::error::{CacheError, Result};

/// Placeholder label when a contact carries no usable naming detail.
pub const UNNAMED: &str = "(Unnamed)";

/// Catch-all bucket for labels that do not start with a letter.
pub const OTHER_GROUP: &str = "#";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayLabelOrder {
    #[default]
    FirstNameFirst,
    LastNameFirst,
}

/// Which name field drives group bucketing and sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupProperty {
    #[default]
    FirstName,
    LastName,
}

impl std::str::FromStr for GroupProperty {
    type Err = CacheError;

    /// Parse the configuration-file spelling of a group property.
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "first-name" => Ok(GroupProperty::FirstName),
            "last-name" => Ok(GroupProperty::LastName),
            other => Err(CacheError::InvalidGroupProperty(other.to_string())),
        }
    }
}

/// Label from naming details, falling back through the contact's other
/// details when no name is set.
pub fn generate_display_label(contact: &Contact, order: DisplayLabelOrder) -> String {
    let first = contact.first_name.trim();
    let last = contact.last_name.trim();

    match (first.is_empty(), last.is_empty()) {
        (false, false) => match order {
            DisplayLabelOrder::FirstNameFirst => format!("{} {}", first, last),
            DisplayLabelOrder::LastNameFirst => format!("{} {}", last, first),
        },
        (false, true) => first.to_string(),
        (true, false) => last.to_string(),
        (true, true) => generate_display_label_from_non_name_details(contact),
    }
}

/// Fallback chain: nickname, presence nickname, store-computed label,
/// account uri, email address, organization, phone number, placeholder.
pub fn generate_display_label_from_non_name_details(contact: &Contact) -> String {
    let nickname = contact.nickname.trim();
    if !nickname.is_empty() {
        return nickname.to_string();
    }

    let presence_nickname = contact.global_presence.nickname.trim();
    if !presence_nickname.is_empty() {
        return presence_nickname.to_string();
    }

    let backend_label = contact.backend_label.trim();
    if !backend_label.is_empty() {
        return backend_label.to_string();
    }

    for account in &contact.online_accounts {
        if !account.account_uri.is_empty() {
            return account.account_uri.clone();
        }
    }

    for email in &contact.email_addresses {
        if !email.address.is_empty() {
            return email.address.clone();
        }
    }

    let organization = contact.organization.trim();
    if !organization.is_empty() {
        return organization.to_string();
    }

    for phone in &contact.phone_numbers {
        if !phone.number.is_empty() {
            return phone.number.clone();
        }
    }

    UNNAMED.to_string()
}

/// Strategy assigning each contact to a name-group bucket.
pub trait NameGrouper {
    /// The bucket for a contact, given its already-computed display label.
    fn name_group(&self, contact: &Contact, display_label: &str) -> String;

    /// Every bucket the strategy can produce, in presentation order.
    fn all_groups(&self) -> Vec<String>;
}

/// Default grouper: the uppercased leading letter of the configured name
/// property, falling back to the display label, then to [`OTHER_GROUP`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCharacterGrouper {
    pub group_property: GroupProperty,
}

impl FirstCharacterGrouper {
    pub fn new(group_property: GroupProperty) -> Self {
        FirstCharacterGrouper { group_property }
    }

    fn leading_group(text: &str) -> Option<String> {
        let first = text.trim().chars().next()?;
        if first.is_alphabetic() {
            Some(first.to_uppercase().collect())
        } else {
            Some(OTHER_GROUP.to_string())
        }
    }
}

impl NameGrouper for FirstCharacterGrouper {
    fn name_group(&self, contact: &Contact, display_label: &str) -> String {
        let name = match self.group_property {
            GroupProperty::FirstName => &contact.first_name,
            GroupProperty::LastName => &contact.last_name,
        };

        Self::leading_group(name)
            .or_else(|| Self::leading_group(display_label))
            .unwrap_or_else(|| OTHER_GROUP.to_string())
    }

    fn all_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = ('A'..='Z').map(|c| c.to_string()).collect();
        groups.push(OTHER_GROUP.to_string());
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{ContactId, EmailAddress, OnlineAccount, PhoneNumber};

    fn named(first: &str, last: &str) -> Contact {
        let mut contact = Contact::new(ContactId(1));
        contact.first_name = first.to_string();
        contact.last_name = last.to_string();
        contact
    }

    #[test]
    fn test_label_order() {
        let contact = named("Alfred", "Tester");
        assert_eq!(
            generate_display_label(&contact, DisplayLabelOrder::FirstNameFirst),
            "Alfred Tester"
        );
        assert_eq!(
            generate_display_label(&contact, DisplayLabelOrder::LastNameFirst),
            "Tester Alfred"
        );
    }

    #[test]
    fn test_single_name_used_as_is() {
        assert_eq!(
            generate_display_label(&named("Alfred", ""), DisplayLabelOrder::LastNameFirst),
            "Alfred"
        );
        assert_eq!(
            generate_display_label(&named("", "Tester"), DisplayLabelOrder::FirstNameFirst),
            "Tester"
        );
    }

    #[test]
    fn test_non_name_fallback_chain() {
        let mut contact = Contact::new(ContactId(1));
        contact.phone_numbers.push(PhoneNumber {
            number: "1234567".to_string(),
        });
        contact.email_addresses.push(EmailAddress {
            address: "berta@example.org".to_string(),
        });
        contact.online_accounts.push(OnlineAccount {
            account_path: "/example/jabber/0".to_string(),
            account_uri: "berta@jabber.example.org".to_string(),
            nickname: String::new(),
        });

        // Account uri outranks email and phone
        assert_eq!(
            generate_display_label(&contact, DisplayLabelOrder::FirstNameFirst),
            "berta@jabber.example.org"
        );

        contact.nickname = "Bee".to_string();
        assert_eq!(
            generate_display_label(&contact, DisplayLabelOrder::FirstNameFirst),
            "Bee"
        );
    }

    #[test]
    fn test_unnamed_placeholder() {
        let contact = Contact::new(ContactId(1));
        assert_eq!(
            generate_display_label(&contact, DisplayLabelOrder::FirstNameFirst),
            UNNAMED
        );
    }

    #[test]
    fn test_group_by_first_name() {
        let grouper = FirstCharacterGrouper::new(GroupProperty::FirstName);
        assert_eq!(grouper.name_group(&named("alfred", "Tester"), "alfred Tester"), "A");
        assert_eq!(grouper.name_group(&named("Ärne", "Tester"), "Ärne Tester"), "Ä");
    }

    #[test]
    fn test_group_falls_back_to_label_then_catch_all() {
        let grouper = FirstCharacterGrouper::new(GroupProperty::LastName);
        let contact = named("Alfred", "");
        assert_eq!(grouper.name_group(&contact, "Alfred"), "A");

        let mut unnamed = Contact::new(ContactId(1));
        unnamed.phone_numbers.push(PhoneNumber {
            number: "5550101".to_string(),
        });
        assert_eq!(grouper.name_group(&unnamed, "5550101"), "#");
    }

    #[test]
    fn test_group_property_parsing() {
        assert_eq!("first-name".parse::<GroupProperty>().ok(), Some(GroupProperty::FirstName));
        assert_eq!("last-name".parse::<GroupProperty>().ok(), Some(GroupProperty::LastName));
        assert!("nickname".parse::<GroupProperty>().is_err());
    }

    #[test]
    fn test_all_groups_end_with_catch_all() {
        let grouper = FirstCharacterGrouper::default();
        let groups = grouper.all_groups();
        assert_eq!(groups.len(), 27);
        assert_eq!(groups.first().map(String::as_str), Some("A"));
        assert_eq!(groups.last().map(String::as_str), Some("#"));
    }
}
