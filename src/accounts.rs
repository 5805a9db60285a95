use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::context::AuthenticatedUser;
use crate::db::now_timestamp;
use crate::errors::{AppError, AppResult};

const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub user: AuthenticatedUser,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interest {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitedPlace {
    pub place_name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub visited_at: String,
}

pub fn register(conn: &Connection, username: &str, password: &str) -> AppResult<AuthenticatedUser> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::Validation("Username is required.".into()));
    }
    if password.is_empty() {
        return Err(AppError::Validation("Password is required.".into()));
    }

    let taken = conn
        .query_row("SELECT 1 FROM users WHERE username = ?1", [username], |_| Ok(()))
        .optional()?
        .is_some();
    if taken {
        return Err(username_taken(username));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| AppError::PasswordHash(err.to_string()))?
        .to_string();
    let user = AuthenticatedUser {
        id: insert_user(conn, username, &password_hash)?,
        username: username.to_string(),
    };
    info!(target: "accounts", user_id = user.id, "registered user");
    Ok(user)
}

fn username_taken(username: &str) -> AppError {
    AppError::Conflict(format!("Username '{username}' is already taken."))
}

// A concurrent registration can claim the name between the lookup and the insert.
fn insert_user(conn: &Connection, username: &str, password_hash: &str) -> AppResult<i64> {
    match conn.execute(
        "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
        params![username, password_hash, now_timestamp()],
    ) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(username_taken(username))
        }
        Err(err) => Err(err.into()),
    }
}

/// Verifies credentials and opens a new session. The raw token is only ever returned here.
pub fn login(conn: &Connection, username: &str, password: &str) -> AppResult<Session> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::Validation(
            "Username and password are required.".into(),
        ));
    }

    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT id, username, password_hash FROM users WHERE username = ?1",
            [username],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let invalid = || AppError::Unauthorized("Invalid username or password.".into());
    let (id, username, stored_hash) = row.ok_or_else(invalid)?;
    let parsed =
        PasswordHash::new(&stored_hash).map_err(|err| AppError::PasswordHash(err.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| invalid())?;

    let mut raw = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    let token = URL_SAFE_NO_PAD.encode(raw);
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
        params![hash_token(&token), id, now_timestamp()],
    )?;

    info!(target: "accounts", user_id = id, "user logged in");
    Ok(Session {
        token,
        user: AuthenticatedUser { id, username },
    })
}

pub fn logout(conn: &Connection, token: &str) -> AppResult<bool> {
    let removed = conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        [hash_token(token)],
    )?;
    debug!(target: "accounts", removed, "session closed");
    Ok(removed > 0)
}

/// Resolves a bearer token to its user; expired sessions resolve to `None` and are removed.
pub fn user_for_session(
    conn: &Connection,
    token: &str,
    ttl: Duration,
) -> AppResult<Option<AuthenticatedUser>> {
    user_for_session_at(conn, token, ttl, Utc::now())
}

pub(crate) fn user_for_session_at(
    conn: &Connection,
    token: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> AppResult<Option<AuthenticatedUser>> {
    let token_hash = hash_token(token);
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT u.id, u.username, s.created_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?1",
            [&token_hash],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((id, username, created_at)) = row else {
        return Ok(None);
    };

    let expired = DateTime::parse_from_rfc3339(&created_at)
        .map(|created| now - created.with_timezone(&Utc) >= ttl)
        .unwrap_or(true);
    if expired {
        conn.execute("DELETE FROM sessions WHERE token_hash = ?1", [&token_hash])?;
        debug!(target: "accounts", user_id = id, "session expired");
        return Ok(None);
    }

    Ok(Some(AuthenticatedUser { id, username }))
}

fn hash_token(token: &str) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

pub fn all_interests(conn: &Connection) -> AppResult<Vec<Interest>> {
    let mut stmt = conn.prepare("SELECT id, name FROM interests ORDER BY name COLLATE NOCASE")?;
    let rows = stmt.query_map([], |row| {
        Ok(Interest {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

pub fn user_interest_ids(conn: &Connection, user_id: i64) -> AppResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT interest_id FROM user_interests WHERE user_id = ?1 ORDER BY interest_id",
    )?;
    let rows = stmt.query_map([user_id], |row| row.get(0))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

pub fn user_interest_names(conn: &Connection, user_id: i64) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT i.name
         FROM interests i
         JOIN user_interests ui ON i.id = ui.interest_id
         WHERE ui.user_id = ?1
         ORDER BY i.name COLLATE NOCASE",
    )?;
    let rows = stmt.query_map([user_id], |row| row.get(0))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

/// Replaces the user's whole interest selection atomically.
pub fn update_user_interests(
    conn: &mut Connection,
    user_id: i64,
    interest_ids: &[i64],
) -> AppResult<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM user_interests WHERE user_id = ?1", [user_id])?;
    {
        let mut known = tx.prepare("SELECT 1 FROM interests WHERE id = ?1")?;
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO user_interests (user_id, interest_id) VALUES (?1, ?2)",
        )?;
        for interest_id in interest_ids {
            if !known.exists([interest_id])? {
                return Err(AppError::Validation(format!(
                    "Unknown interest id {interest_id}."
                )));
            }
            insert.execute([user_id, *interest_id])?;
        }
    }
    tx.commit()?;
    info!(target: "accounts", user_id, count = interest_ids.len(), "updated interests");
    Ok(())
}

/// Newest first.
pub fn visited_places(conn: &Connection, user_id: i64, limit: Option<usize>) -> AppResult<Vec<VisitedPlace>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT place_name, latitude, longitude, visited_at
         FROM visited_places
         WHERE user_id = ?1
         ORDER BY visited_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, limit], |row| {
        Ok(VisitedPlace {
            place_name: row.get(0)?,
            lat: row.get(1)?,
            lng: row.get(2)?,
            visited_at: row.get(3)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

pub fn add_visited_place(
    conn: &Connection,
    user_id: i64,
    place_name: Option<&str>,
    lat: f64,
    lng: f64,
) -> AppResult<VisitedPlace> {
    let visited_at = now_timestamp();
    conn.execute(
        "INSERT INTO visited_places (user_id, place_name, latitude, longitude, visited_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user_id, place_name, lat, lng, visited_at],
    )?;
    debug!(target: "accounts", user_id, "recorded visited place");
    Ok(VisitedPlace {
        place_name: place_name.map(str::to_string),
        lat,
        lng,
        visited_at,
    })
}
