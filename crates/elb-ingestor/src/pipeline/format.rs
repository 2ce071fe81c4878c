//! Access-log field grammars
//!
//! A [`LogFormat`] lists the space-separated fields of one log line in order.
//! The first `required` fields must be present for a line to count as a
//! record at all; later fields are optional and their absence only marks the
//! record as partial.

use std::str::FromStr;

use crate::error::IngestError;

/// How a single token is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// RFC 3339 timestamp; becomes the record timestamp
    Timestamp,
    Text,
    /// `ip:port`, stored as `<name>_ip` and `<name>_port`
    Endpoint,
    Float,
    Integer,
    /// `METHOD URL PROTOCOL`, stored as `request_method`, `request_url`, `request_protocol`
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    name: String,
    fields: Vec<FieldSpec>,
    required: usize,
}

impl LogFormat {
    /// Build a custom grammar.
    ///
    /// Exactly one [`FieldKind::Timestamp`] field is allowed, and it must
    /// fall inside the required prefix.
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldSpec>,
        required: usize,
    ) -> Result<Self, IngestError> {
        let name = name.into();
        if required == 0 || required > fields.len() {
            return Err(IngestError::Config(format!(
                "Log format '{}': required field count {} out of range 1..={}",
                name,
                required,
                fields.len()
            )));
        }

        let timestamps: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == FieldKind::Timestamp)
            .map(|(i, _)| i)
            .collect();
        match timestamps.as_slice() {
            [i] if *i < required => {},
            _ => {
                return Err(IngestError::Config(format!(
                    "Log format '{}' needs exactly one required timestamp field",
                    name
                )))
            },
        }

        Ok(Self {
            name,
            fields,
            required,
        })
    }

    /// Classic Load Balancer access log.
    pub fn classic() -> Self {
        let fields = classic_fields();
        Self {
            name: "classic".to_string(),
            required: 12,
            fields,
        }
    }

    /// Application Load Balancer access log: a leading `type` field, the
    /// classic fields, then the ALB-only trailer.
    pub fn application() -> Self {
        use FieldKind::*;

        let mut fields = vec![FieldSpec::new("type", Text)];
        fields.extend(classic_fields());
        for (name, kind) in [
            ("target_group_arn", Text),
            ("trace_id", Text),
            ("domain_name", Text),
            ("chosen_cert_arn", Text),
            ("matched_rule_priority", Integer),
            ("request_creation_time", Text),
            ("actions_executed", Text),
            ("redirect_url", Text),
            ("error_reason", Text),
        ] {
            fields.push(FieldSpec::new(name, kind));
        }

        Self {
            name: "application".to_string(),
            required: 13,
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Number of leading fields a line must carry to be a record
    pub fn required(&self) -> usize {
        self.required
    }
}

impl FromStr for LogFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" | "elb" => Ok(Self::classic()),
            "application" | "alb" => Ok(Self::application()),
            other => Err(IngestError::Config(format!(
                "Unknown log format '{}', expected 'classic' or 'application'",
                other
            ))),
        }
    }
}

fn classic_fields() -> Vec<FieldSpec> {
    use FieldKind::*;

    [
        ("timestamp", Timestamp),
        ("elb", Text),
        ("client", Endpoint),
        ("backend", Endpoint),
        ("request_processing_time", Float),
        ("backend_processing_time", Float),
        ("response_processing_time", Float),
        ("elb_status_code", Integer),
        ("backend_status_code", Integer),
        ("received_bytes", Integer),
        ("sent_bytes", Integer),
        ("request", Request),
        ("user_agent", Text),
        ("ssl_cipher", Text),
        ("ssl_protocol", Text),
    ]
    .into_iter()
    .map(|(name, kind)| FieldSpec::new(name, kind))
    .collect()
}
