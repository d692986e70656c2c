//! QR check-in payloads: `COLEGIO:{TYPE}:{ID}:{DNI}`.
//!
//! Parsing never fails; a malformed payload is reported as `{"isValid": false}`
//! so scanners can show a message instead of crashing on random codes.

use crate::model::Role;
use serde::Serialize;

pub const QR_PREFIX: &str = "COLEGIO";
const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonType {
    Alumno,
    Profesor,
    Auxiliar,
    Admin,
}

impl PersonType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALUMNO" => Some(Self::Alumno),
            "PROFESOR" => Some(Self::Profesor),
            "AUXILIAR" => Some(Self::Auxiliar),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alumno => "ALUMNO",
            Self::Profesor => "PROFESOR",
            Self::Auxiliar => "AUXILIAR",
            Self::Admin => "ADMIN",
        }
    }

    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Student => Self::Alumno,
            Role::Teacher => Self::Profesor,
            Role::Staff => Self::Auxiliar,
            Role::Admin => Self::Admin,
        }
    }

    pub fn role(self) -> Role {
        match self {
            Self::Alumno => Role::Student,
            Self::Profesor => Role::Teacher,
            Self::Auxiliar => Role::Staff,
            Self::Admin => Role::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    pub tipo: String,
    pub id: String,
    pub dni: Option<String>,
}

impl QrPayload {
    pub fn person_type(&self) -> Option<PersonType> {
        PersonType::parse(&self.tipo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrParse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dni: Option<String>,
}

impl From<Option<QrPayload>> for QrParse {
    fn from(v: Option<QrPayload>) -> Self {
        match v {
            Some(p) => QrParse {
                is_valid: true,
                tipo: Some(p.tipo),
                id: Some(p.id),
                dni: p.dni,
            },
            None => QrParse {
                is_valid: false,
                tipo: None,
                id: None,
                dni: None,
            },
        }
    }
}

pub fn parse_payload(raw: &str) -> Option<QrPayload> {
    let parts: Vec<&str> = raw.trim().split(SEPARATOR).collect();
    if parts.len() < 3 || parts[0] != QR_PREFIX {
        return None;
    }
    let tipo = parts[1].trim();
    let id = parts[2].trim();
    if tipo.is_empty() || id.is_empty() {
        return None;
    }
    let dni = parts
        .get(3)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Some(QrPayload {
        tipo: tipo.to_string(),
        id: id.to_string(),
        dni,
    })
}

pub fn format_payload(kind: PersonType, id: &str, dni: Option<&str>) -> Result<String, String> {
    if id.trim().is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id.contains(SEPARATOR) {
        return Err("id must not contain ':'".to_string());
    }
    let dni = dni.unwrap_or("");
    if dni.contains(SEPARATOR) {
        return Err("dni must not contain ':'".to_string());
    }
    Ok(format!("{QR_PREFIX}:{}:{id}:{dni}", kind.as_str()))
}
