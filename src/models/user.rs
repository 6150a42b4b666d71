use serde::{Deserialize, Serialize};

use crate::models::ids::UserId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Faculty,
    Organizer,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "admin" | "superadmin" => Role::Admin,
            "organizer" => Role::Organizer,
            "faculty" => Role::Faculty,
            _ => Role::Student,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Role,
}

impl UserSummary {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
