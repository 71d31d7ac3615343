use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use ferry_store::links::chat_key;
use ferry_store::{Keyspace, LinkTable, RoomLink};

use crate::config::{Bot, CONFIG_VERSION, Content, Federation};

/// The version-0 configuration layout: separate room-list and event-list
/// files instead of one store path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V0Content {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    served_user: String,
    #[serde(default)]
    matrix: V0Matrix,
    #[serde(default)]
    telegram: V0Telegram,
    #[serde(default)]
    database: V0Database,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V0Matrix {
    #[serde(rename = "baseURL", default)]
    base_url: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(rename = "deviceID", default)]
    device_id: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct V0Telegram {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V0Database {
    #[serde(default)]
    room_list: String,
}

/// One entry of the version-0 room-list file (a JSON array).
#[derive(Debug, Deserialize)]
struct LegacyRoom {
    #[serde(rename = "ChatID", default)]
    chat_id: i64,
    #[serde(rename = "RoomID", default)]
    room_id: String,
    #[serde(rename = "RoomName", default)]
    room_name: String,
    #[serde(rename = "Avatar", default)]
    avatar: String,
}

/// One-shot config upgrade. Returns the upgraded content plus the legacy
/// room-list path, if one exists and still needs importing into the store.
pub fn ver0_to_1(value: serde_json::Value) -> Result<(Content, Option<PathBuf>)> {
    let v0: V0Content = serde_json::from_value(value).context("decode v0 configuration")?;
    let defaults = Content::default();

    let content = Content {
        log_level: v0.log_level.unwrap_or(defaults.log_level),
        counterpart: v0.served_user,
        federation: Federation {
            base_url: v0.matrix.base_url,
            username: v0.matrix.username,
            password: v0.matrix.password,
            device_id: v0.matrix.device_id,
            token: v0.matrix.token,
        },
        bot: Bot {
            token: v0.telegram.token,
            poll_timeout_secs: defaults.bot.poll_timeout_secs,
        },
        database: defaults.database,
        seen_retention_days: None,
        version: CONFIG_VERSION,
    };

    let legacy = if v0.database.room_list.is_empty() {
        None
    } else {
        Some(PathBuf::from(v0.database.room_list))
    };
    Ok((content, legacy))
}

/// Import a version-0 room-list file into the store through the normal
/// locked create path. The old file is renamed to `.bak` first, so a failed
/// import can be retried from the backup by hand.
pub async fn import_legacy_rooms(links: &LinkTable, path: PathBuf) -> Result<usize> {
    let backup = {
        let mut p = path.clone().into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    };
    match fs::rename(&path, &backup) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no legacy room list to import");
            return Ok(0);
        }
        Err(e) => return Err(e).context("back up legacy room list"),
    }

    let raw = fs::read(&backup).context("read legacy room list")?;
    let rooms: Vec<LegacyRoom> = serde_json::from_slice(&raw).context("parse legacy room list")?;

    let locks = links.locks().clone();
    let mut imported = 0;
    for room in rooms {
        if room.chat_id == 0 || room.room_id.is_empty() {
            warn!(chat_id = room.chat_id, "skipping incomplete legacy entry");
            continue;
        }

        let chat_lock = locks
            .handle(Keyspace::Chat, &chat_key(room.chat_id))
            .write_owned()
            .await;
        if links.index_by_chat(room.chat_id)?.is_some() {
            continue;
        }
        let (id, id_lock) = links.allocate_id().await?;
        let room_lock = locks
            .handle(Keyspace::Room, room.room_id.as_bytes())
            .write_owned()
            .await;

        let link = RoomLink {
            chat_id: room.chat_id,
            room_id: room.room_id.clone(),
            display_name: room.room_name,
            avatar_ref: room.avatar,
            last_profile_sync: None,
        };
        links.put_link(&id, &link)?;
        links.put_chat_index(room.chat_id, &id)?;
        links.put_room_index(&room.room_id, &id)?;

        drop(room_lock);
        drop(id_lock);
        drop(chat_lock);
        imported += 1;
    }

    info!(imported, "legacy room list imported");
    Ok(imported)
}
