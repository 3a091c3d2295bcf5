//! Form payloads posted by client editors.
//!
//! Values are read from `application/x-www-form-urlencoded` bodies and from
//! the URL query string. Body values win over query values with the same name.

use url::form_urlencoded;

use crate::error::ProtocolError;

/// Form field names used by the client editors.
pub mod fields {
    pub const TICKET: &str = "theTicket";
    pub const DESCRIPTION: &str = "theDescription";
    pub const LEAD: &str = "theLead";
    pub const ASSIGNEE: &str = "theAssignee";
    pub const STATE: &str = "theState";
    pub const FOLDER: &str = "theFolder";
    pub const TEMPLATE_ID: &str = "theTemplateID";
    pub const TEMPLATE_NAME: &str = "theTemplateName";
}

/// Decoded form values in precedence order.
#[derive(Debug, Clone, Default)]
pub struct FormFields {
    pairs: Vec<(String, String)>,
}

impl FormFields {
    /// Decode a urlencoded body followed by an optional query string.
    pub fn parse(body: &[u8], query: Option<&str>) -> Self {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(body)
            .into_owned()
            .collect();
        if let Some(query) = query {
            pairs.extend(form_urlencoded::parse(query.as_bytes()).into_owned());
        }
        Self { pairs }
    }

    /// First value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Value for `name`, or an empty string.
    pub fn get_or_empty(&self, name: &str) -> String {
        self.get(name).unwrap_or_default().to_string()
    }

    /// Non-empty value for `name`.
    pub fn require(&self, name: &'static str) -> Result<String, ProtocolError> {
        match self.get(name).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(ProtocolError::MissingField(name)),
        }
    }
}

/// `POST /linkTicket`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTicketForm {
    pub ticket: String,
    pub description: String,
    pub lead: String,
    pub assignee: String,
}

impl LinkTicketForm {
    pub fn from_fields(form: &FormFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            ticket: form.require(fields::TICKET)?,
            description: form.get_or_empty(fields::DESCRIPTION),
            lead: form.get_or_empty(fields::LEAD),
            assignee: form.get_or_empty(fields::ASSIGNEE),
        })
    }
}

/// `POST /ready`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyForm {
    pub state: String,
    pub folder: String,
}

impl ReadyForm {
    pub fn from_fields(form: &FormFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            // A missing state is simply "not ready".
            state: form.get_or_empty(fields::STATE),
            folder: form.require(fields::FOLDER)?,
        })
    }
}

/// `POST /WIP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipForm {
    pub folder: String,
    pub template_id: String,
    pub template_name: String,
}

impl WipForm {
    pub fn from_fields(form: &FormFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            folder: form.require(fields::FOLDER)?,
            template_id: form.require(fields::TEMPLATE_ID)?,
            template_name: form.require(fields::TEMPLATE_NAME)?,
        })
    }
}

/// `POST /RemoveWIP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveWipForm {
    pub folder: String,
    pub template_id: String,
}

impl RemoveWipForm {
    pub fn from_fields(form: &FormFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            folder: form.require(fields::FOLDER)?,
            template_id: form.require(fields::TEMPLATE_ID)?,
        })
    }
}
