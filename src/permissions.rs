// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Section/action permission model.
//!
//! Stored permissions are a JSON blob such as
//! `{"billing": {"view": true, "edit": false}}`. On read it is decoded into a
//! [`PermissionMap`]: a map from [`Section`] to a three-bit [`ActionSet`].
//! Unknown sections and actions are dropped, so they are never written back.
//!
//! Evaluation order:
//! 1. `clinic_owner` is allowed everything in its clinic.
//! 2. Otherwise the map decides; a missing entry denies.
//! 3. `edit` or `delete` on a section implies `view` on it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::tenant::UserPrincipal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Patients,
    Appointments,
    Billing,
    Reports,
    Attendance,
    Staff,
    Settings,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::Patients,
        Section::Appointments,
        Section::Billing,
        Section::Reports,
        Section::Attendance,
        Section::Staff,
        Section::Settings,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Patients => "patients",
            Section::Appointments => "appointments",
            Section::Billing => "billing",
            Section::Reports => "reports",
            Section::Attendance => "attendance",
            Section::Staff => "staff",
            Section::Settings => "settings",
        }
    }

    /// Accepts the canonical names plus the legacy keys older clients wrote
    /// (`users` for staff, `clinic` for settings).
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "patients" => Some(Section::Patients),
            "appointments" => Some(Section::Appointments),
            "billing" => Some(Section::Billing),
            "reports" => Some(Section::Reports),
            "attendance" => Some(Section::Attendance),
            "staff" | "users" => Some(Section::Staff),
            "settings" | "clinic" => Some(Section::Settings),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Edit,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::View, Action::Edit, Action::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Edit => "edit",
            Action::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "view" => Some(Action::View),
            "edit" => Some(Action::Edit),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Action::View => 0b001,
            Action::Edit => 0b010,
            Action::Delete => 0b100,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granted actions on one section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const EMPTY: ActionSet = ActionSet(0);
    pub const ALL: ActionSet = ActionSet(0b111);

    #[must_use]
    pub fn with(mut self, action: Action) -> Self {
        self.0 |= action.bit();
        self
    }

    pub fn insert(&mut self, action: Action) {
        self.0 |= action.bit();
    }

    pub fn remove(&mut self, action: Action) {
        self.0 &= !action.bit();
    }

    /// Literal membership, no implication.
    #[must_use]
    pub fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    /// Membership with `edit`/`delete` implying `view`.
    #[must_use]
    pub fn permits(self, action: Action) -> bool {
        match action {
            Action::View => self.0 != 0,
            other => self.contains(other),
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMap(BTreeMap<Section, ActionSet>);

impl PermissionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stored blob. Anything that is not `{section: {action: true}}`
    /// contributes nothing.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let mut map = BTreeMap::new();
        let Some(sections) = value.as_object() else {
            return Self(map);
        };
        for (key, actions) in sections {
            let Some(section) = Section::parse(key) else {
                continue;
            };
            let Some(actions) = actions.as_object() else {
                continue;
            };
            let set: &mut ActionSet = map.entry(section).or_default();
            for (name, flag) in actions {
                if let Some(action) = Action::parse(name) {
                    if is_granted(flag) {
                        set.insert(action);
                    }
                }
            }
        }
        map.retain(|_, set| !set.is_empty());
        Self(map)
    }

    /// Canonical blob: every known action spelled out per granted section.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (section, set) in &self.0 {
            let mut actions = Map::new();
            for action in Action::ALL {
                actions.insert(action.as_str().to_string(), Value::Bool(set.contains(action)));
            }
            out.insert(section.as_str().to_string(), Value::Object(actions));
        }
        Value::Object(out)
    }

    #[must_use]
    pub fn grant(mut self, section: Section, action: Action) -> Self {
        self.0.entry(section).or_default().insert(action);
        self
    }

    #[must_use]
    pub fn actions(&self, section: Section) -> ActionSet {
        self.0.get(&section).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn allows(&self, section: Section, action: Action) -> bool {
        self.actions(section).permits(action)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Section, ActionSet)> + '_ {
        self.0.iter().map(|(s, a)| (*s, *a))
    }
}

fn is_granted(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

impl Serialize for PermissionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PermissionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(PermissionMap::from_json(&value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ClinicOwner,
    Doctor,
    Receptionist,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::ClinicOwner => "clinic_owner",
            Role::Doctor => "doctor",
            Role::Receptionist => "receptionist",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clinic_owner" => Some(Role::ClinicOwner),
            "doctor" => Some(Role::Doctor),
            "receptionist" => Some(Role::Receptionist),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn allowed(user: &UserPrincipal, section: Section, action: Action) -> bool {
    user.role == Role::ClinicOwner || user.permissions.allows(section, action)
}

pub fn require(user: &UserPrincipal, section: Section, action: Action) -> CoreResult<()> {
    if allowed(user, section, action) {
        Ok(())
    } else {
        tracing::debug!(user_id = user.id, %section, %action, "permission denied");
        Err(CoreError::Forbidden { section, action })
    }
}
