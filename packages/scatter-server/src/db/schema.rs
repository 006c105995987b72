//! SQLite schema for the metadata store.
//!
//! The store is the only durable state in the control plane; everything
//! else (relay FIFOs, auth sessions, rebalance latches) is in-memory and
//! recoverable. Chunks are content-addressed: `chunks.id` is the hex
//! SHA-256 of the chunk bytes and doubles as the hash column. Rows are
//! keyed `(file_id, sequence)` so a file's sequence column stays gap-free
//! even when the same bytes appear at several positions; placements and
//! physical storage deduplicate on the content id.

/// SQL to create all tables.
pub const CREATE_TABLES: &str = r#"
-- Account owners
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT UNIQUE NOT NULL,
    -- SHA-256 hex credential digest
    password TEXT NOT NULL,
    created_at TEXT
);

-- Registered devices. user_id is NULL until the device is claimed.
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    public_key TEXT NOT NULL,
    name TEXT,
    -- RFC3339; authoritative for onlineness within the offline threshold
    last_seen TEXT,
    ip TEXT,
    online INTEGER NOT NULL DEFAULT 0,
    claim_token TEXT,
    -- 'agent' (reached via relay) or 'cloud' (reached via provider API)
    type TEXT NOT NULL DEFAULT 'agent',
    FOREIGN KEY(user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    -- basename only
    path TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    -- SHA-256 hex of the concatenated plaintext chunks
    hash TEXT NOT NULL DEFAULT '',
    created_at TEXT,
    updated_at TEXT,
    FOREIGN KEY(user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id);

-- Content-addressed: id == hash == sha256_hex(bytes)
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT NOT NULL,
    file_id TEXT,
    sequence INTEGER NOT NULL,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    PRIMARY KEY (file_id, sequence),
    FOREIGN KEY(file_id) REFERENCES files(id)
);
CREATE INDEX IF NOT EXISTS idx_chunks_id ON chunks(id);

-- chunk -> device placement index; many-to-many
-- chunk_id intentionally has no FOREIGN KEY to chunks(id): that column is
-- content-addressed and not unique (the same id can back several
-- (file_id, sequence) rows), so SQLite cannot index it for FK resolution.
CREATE TABLE IF NOT EXISTS chunk_locations (
    chunk_id TEXT,
    device_id TEXT,
    PRIMARY KEY (chunk_id, device_id),
    FOREIGN KEY(device_id) REFERENCES devices(id)
);
CREATE INDEX IF NOT EXISTS idx_locations_device ON chunk_locations(device_id);

-- Append-only deletion ledger, consumed by offline agents via ?since=
CREATE TABLE IF NOT EXISTS deleted_files (
    id TEXT PRIMARY KEY,
    file_id TEXT,
    -- JSON array of chunk ids
    chunk_ids TEXT,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_deleted_at ON deleted_files(deleted_at);

-- Per-user cloud backend OAuth token; never leaves the backend adapter
CREATE TABLE IF NOT EXISTS cloud_tokens (
    user_id TEXT PRIMARY KEY,
    access_token TEXT,
    refresh_token TEXT,
    token_type TEXT,
    expiry TEXT,
    FOREIGN KEY(user_id) REFERENCES users(id)
);
"#;
