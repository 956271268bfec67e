//! Managed-group engine: in-memory relay-managed group state, moderation
//! state machine, relay-signed snapshot emission.
//!
//! All mutation goes through a single exclusive lock; relay-signed snapshots
//! are built while holding it, so no snapshot can ever observe a half-applied
//! mutation. A reader/writer split on the group map would win throughput but
//! isn't worth the risk of weakening that guarantee.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::idgen;
use crate::model::{Event, Tag};

#[derive(Debug, Clone, Default)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub members: HashSet<String>,
    pub admins: HashMap<String, Vec<String>>,
    pub roles: HashMap<String, String>,
    pub private: bool,
    pub restricted: bool,
    pub hidden: bool,
    pub closed: bool,
    pub invites: HashSet<String>,
    pub created_at: i64,
}

pub const GROUP_ID_MAX_LEN: usize = 128;

pub fn is_valid_group_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= GROUP_ID_MAX_LEN
        && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub struct GroupEngine {
    relay_owner: RwLock<String>,
    groups: RwLock<HashMap<String, Group>>,
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

impl GroupEngine {
    pub fn new(relay_owner_pubkey: String) -> Self {
        Self { relay_owner: RwLock::new(relay_owner_pubkey), groups: RwLock::new(HashMap::new()) }
    }

    pub fn set_owner(&self, pubkey: String) {
        *self.relay_owner.write() = pubkey;
    }

    pub fn is_member(&self, group_id: &str, pubkey: &str) -> bool {
        self.groups.read().get(group_id).map(|g| g.members.contains(pubkey)).unwrap_or(false)
    }

    /// `group.admins` only ever holds pubkeys a put-user explicitly granted
    /// role names to (see `apply_put_user`), so membership here is itself
    /// the admin check, not a mirror of `group.members`.
    fn is_authorised(&self, group: &Group, pubkey: &str) -> bool {
        pubkey == *self.relay_owner.read() || group.admins.contains_key(pubkey)
    }

    /// Validator hook: does this event's author have the standing to
    /// perform the action it describes?
    pub fn validate_group_event(&self, event: &Event) -> Result<(), String> {
        let Some(group_id) = event.first_tag_value("h") else {
            return Ok(());
        };
        if !is_valid_group_id(group_id) {
            return Err("invalid: malformed group id".to_string());
        }

        let groups = self.groups.read();
        match event.kind {
            9007 => {
                if groups.contains_key(group_id) {
                    return Err("restricted: group already exists".to_string());
                }
                Ok(())
            }
            9000..=9009 => {
                let group = groups
                    .get(group_id)
                    .ok_or_else(|| "restricted: group does not exist".to_string())?;
                if !self.is_authorised(group, &event.pubkey) {
                    return Err("restricted: only the relay owner or an admin may moderate this group".to_string());
                }
                Ok(())
            }
            9021 => {
                if let Some(group) = groups.get(group_id) {
                    if group.closed {
                        let has_valid_invite = event
                            .first_tag_value("code")
                            .map(|code| group.invites.contains(code))
                            .unwrap_or(false);
                        if !has_valid_invite {
                            return Err("restricted: closed group requires a valid invite code".to_string());
                        }
                    }
                }
                Ok(())
            }
            9022 => {
                if let Some(group) = groups.get(group_id) {
                    if !group.members.contains(&event.pubkey) {
                        return Err("restricted: not a current member".to_string());
                    }
                }
                Ok(())
            }
            _ if crate::validator::kinds::in_open_range(event.kind) => {
                if let Some(group) = groups.get(group_id) {
                    if group.restricted && !group.members.contains(&event.pubkey) {
                        return Err("restricted: posting requires group membership".to_string());
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Apply a moderation/membership mutation and return the relay-signed
    /// snapshot quadruple (kinds 39000-39003) plus any companion event the
    /// mutation also produces (e.g. a put-user event alongside a join).
    pub fn apply_and_snapshot(
        &self,
        event: &Event,
        relay_secret_hex: &str,
        relay_pubkey_hex: &str,
    ) -> Vec<Event> {
        let Some(group_id) = event.first_tag_value("h").map(str::to_string) else {
            return Vec::new();
        };

        let mut groups = self.groups.write();
        let mut companions: Vec<Event> = Vec::new();

        match event.kind {
            9007 => {
                groups.entry(group_id.clone()).or_insert_with(|| Group {
                    id: group_id.clone(),
                    created_at: now(),
                    ..Default::default()
                });
            }
            9000 => {
                if let Some(group) = groups.get_mut(&group_id) {
                    apply_put_user(group, &event.tags);
                }
            }
            9001 => {
                if let Some(group) = groups.get_mut(&group_id) {
                    apply_remove_user(group, &event.tags);
                }
            }
            9002 => {
                if let Some(group) = groups.get_mut(&group_id) {
                    apply_edit_metadata(group, &event.tags);
                }
            }
            9008 => {
                groups.remove(&group_id);
                return Vec::new();
            }
            9009 => {
                if let Some(group) = groups.get_mut(&group_id) {
                    group.invites.insert(idgen::generate_invite_code());
                }
                return Vec::new();
            }
            9021 => {
                let accepted = {
                    let group = groups.entry(group_id.clone()).or_insert_with(|| Group {
                        id: group_id.clone(),
                        created_at: now(),
                        ..Default::default()
                    });
                    if group.closed {
                        if let Some(code) = event.first_tag_value("code") {
                            if group.invites.remove(code) {
                                group.members.insert(event.pubkey.clone());
                                true
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    } else {
                        group.members.insert(event.pubkey.clone());
                        true
                    }
                };
                if accepted {
                    companions.push(build_put_user_event(
                        &group_id,
                        &event.pubkey,
                        relay_secret_hex,
                        relay_pubkey_hex,
                    ));
                } else {
                    return Vec::new();
                }
            }
            9022 => {
                if let Some(group) = groups.get_mut(&group_id) {
                    if !group.members.remove(&event.pubkey) {
                        return Vec::new();
                    }
                    group.admins.remove(&event.pubkey);
                }
                companions.push(build_remove_user_event(
                    &group_id,
                    &event.pubkey,
                    relay_secret_hex,
                    relay_pubkey_hex,
                ));
            }
            _ => return Vec::new(),
        }

        let Some(group) = groups.get(&group_id) else { return companions };
        let mut snapshot = build_snapshot(group, relay_secret_hex, relay_pubkey_hex);
        companions.append(&mut snapshot);
        companions
    }
}

fn apply_put_user(group: &mut Group, tags: &[Tag]) {
    for tag in tags {
        if tag.first().map(|s| s.as_str()) == Some("p") {
            if let Some(pubkey) = tag.get(1) {
                group.members.insert(pubkey.clone());
                // Only a put-user that actually names roles grants admin
                // standing; a bare `["p", <pubkey>]` is membership only.
                let roles: Vec<String> = tag.iter().skip(2).cloned().collect();
                if roles.is_empty() {
                    group.admins.remove(pubkey);
                } else {
                    group.admins.insert(pubkey.clone(), roles);
                }
            }
        }
    }
}

fn apply_remove_user(group: &mut Group, tags: &[Tag]) {
    for tag in tags {
        if tag.first().map(|s| s.as_str()) == Some("p") {
            if let Some(pubkey) = tag.get(1) {
                group.members.remove(pubkey);
                group.admins.remove(pubkey);
            }
        }
    }
}

fn apply_edit_metadata(group: &mut Group, tags: &[Tag]) {
    for tag in tags {
        match tag.first().map(|s| s.as_str()) {
            Some("name") => group.name = tag.get(1).cloned().unwrap_or_default(),
            Some("about") => group.about = tag.get(1).cloned().unwrap_or_default(),
            Some("picture") => group.picture = tag.get(1).cloned().unwrap_or_default(),
            Some("private") => group.private = true,
            Some("public") => group.private = false,
            Some("restricted") => group.restricted = true,
            Some("unrestricted") => group.restricted = false,
            Some("hidden") => group.hidden = true,
            Some("visible") => group.hidden = false,
            Some("closed") => group.closed = true,
            Some("open") => group.closed = false,
            _ => {}
        }
    }
}

fn sign_relay_event(
    kind: u32,
    content: String,
    tags: Vec<Tag>,
    relay_secret_hex: &str,
    relay_pubkey_hex: &str,
) -> Event {
    let mut event = Event {
        id: String::new(),
        pubkey: relay_pubkey_hex.to_string(),
        created_at: now(),
        kind,
        tags,
        content,
        sig: String::new(),
    };
    event.id = event.compute_id();
    event.sig = idgen::sign(relay_secret_hex, &event.id);
    event
}

fn build_put_user_event(group_id: &str, pubkey: &str, sk: &str, pk: &str) -> Event {
    sign_relay_event(
        9000,
        String::new(),
        vec![vec!["h".into(), group_id.into()], vec!["p".into(), pubkey.into()]],
        sk,
        pk,
    )
}

fn build_remove_user_event(group_id: &str, pubkey: &str, sk: &str, pk: &str) -> Event {
    sign_relay_event(
        9001,
        String::new(),
        vec![vec!["h".into(), group_id.into()], vec!["p".into(), pubkey.into()]],
        sk,
        pk,
    )
}

/// Build the relay-signed quadruple of replaceable metadata snapshots
/// (kinds 39000-39003, each carrying `d <groupID>`).
fn build_snapshot(group: &Group, sk: &str, pk: &str) -> Vec<Event> {
    let d_tag = vec!["d".into(), group.id.clone()];

    let profile_content = serde_json::json!({
        "name": group.name,
        "about": group.about,
        "picture": group.picture,
        "private": group.private,
        "restricted": group.restricted,
        "hidden": group.hidden,
        "closed": group.closed,
    })
    .to_string();
    let profile = sign_relay_event(39000, profile_content, vec![d_tag.clone()], sk, pk);

    let admin_tags: Vec<Tag> = std::iter::once(d_tag.clone())
        .chain(group.admins.keys().map(|pk| vec!["p".into(), pk.clone()]))
        .collect();
    let admins = sign_relay_event(39001, String::new(), admin_tags, sk, pk);

    let member_tags: Vec<Tag> = std::iter::once(d_tag.clone())
        .chain(group.members.iter().map(|pk| vec!["p".into(), pk.clone()]))
        .collect();
    let members = sign_relay_event(39002, String::new(), member_tags, sk, pk);

    let role_tags: Vec<Tag> = std::iter::once(d_tag)
        .chain(group.roles.iter().map(|(name, desc)| vec!["role".into(), name.clone(), desc.clone()]))
        .collect();
    let roles = sign_relay_event(39003, String::new(), role_tags, sk, pk);

    vec![profile, admins, members, roles]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::generate_keypair;

    fn event(kind: u32, pubkey: &str, tags: Vec<Tag>) -> Event {
        let mut e = Event {
            id: String::new(),
            pubkey: pubkey.to_string(),
            created_at: 1000,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        };
        e.id = e.compute_id();
        e
    }

    #[test]
    fn creation_then_duplicate_is_rejected() {
        let engine = GroupEngine::new("owner".to_string());
        let (sk, pk) = generate_keypair();
        let create = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        assert!(engine.validate_group_event(&create).is_ok());
        engine.apply_and_snapshot(&create, &sk, &pk);

        let duplicate = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        assert!(engine.validate_group_event(&duplicate).is_err());
    }

    #[test]
    fn join_request_on_closed_group_requires_invite() {
        let engine = GroupEngine::new("owner".to_string());
        let (sk, pk) = generate_keypair();
        let create = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        engine.apply_and_snapshot(&create, &sk, &pk);

        let close = event(
            9002,
            "owner",
            vec![vec!["h".into(), "g1".into()], vec!["closed".into()]],
        );
        engine.apply_and_snapshot(&close, &sk, &pk);

        let join = event(9021, "newbie", vec![vec!["h".into(), "g1".into()]]);
        assert!(engine.validate_group_event(&join).is_err());

        let invites = {
            let groups = engine.groups.read();
            groups.get("g1").unwrap().invites.clone()
        };
        assert!(invites.is_empty());
    }

    #[test]
    fn join_with_invite_consumes_it_and_adds_member() {
        let engine = GroupEngine::new("owner".to_string());
        let (sk, pk) = generate_keypair();
        let create = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        engine.apply_and_snapshot(&create, &sk, &pk);
        let close = event(9002, "owner", vec![vec!["h".into(), "g1".into()], vec!["closed".into()]]);
        engine.apply_and_snapshot(&close, &sk, &pk);

        let code = {
            let mut groups = engine.groups.write();
            let group = groups.get_mut("g1").unwrap();
            let code = "feedface".to_string();
            group.invites.insert(code.clone());
            code
        };

        let join = event(9021, "newbie", vec![vec!["h".into(), "g1".into()], vec!["code".into(), code]]);
        assert!(engine.validate_group_event(&join).is_ok());
        let snapshot = engine.apply_and_snapshot(&join, &sk, &pk);
        assert!(!snapshot.is_empty());

        let groups = engine.groups.read();
        let group = groups.get("g1").unwrap();
        assert!(group.members.contains("newbie"));
        assert!(!group.invites.contains("feedface"));
    }

    #[test]
    fn plain_member_put_user_does_not_grant_admin() {
        let engine = GroupEngine::new("owner".to_string());
        let (sk, pk) = generate_keypair();
        let create = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        engine.apply_and_snapshot(&create, &sk, &pk);

        let put_member = event(
            9000,
            "owner",
            vec![vec!["h".into(), "g1".into()], vec!["p".into(), "member1".into()]],
        );
        assert!(engine.validate_group_event(&put_member).is_ok());
        engine.apply_and_snapshot(&put_member, &sk, &pk);

        assert!(engine.is_member("g1", "member1"));

        let moderate = event(
            9001,
            "member1",
            vec![vec!["h".into(), "g1".into()], vec!["p".into(), "owner".into()]],
        );
        assert!(engine.validate_group_event(&moderate).is_err());
    }

    #[test]
    fn non_admin_cannot_moderate() {
        let engine = GroupEngine::new("owner".to_string());
        let (sk, pk) = generate_keypair();
        let create = event(9007, "owner", vec![vec!["h".into(), "g1".into()]]);
        engine.apply_and_snapshot(&create, &sk, &pk);

        let put_user = event(
            9000,
            "random",
            vec![vec!["h".into(), "g1".into()], vec!["p".into(), "u1".into()]],
        );
        assert!(engine.validate_group_event(&put_user).is_err());
    }
}
