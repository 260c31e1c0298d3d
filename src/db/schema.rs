pub const SCHEMA: &str = r#"
-- Photos: one row per distinct content hash, in ingestion order
CREATE TABLE IF NOT EXISTS photos (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL UNIQUE,      -- hex SHA-256 of the file bytes
    original_filename TEXT NOT NULL,
    stored_path TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    face_count INTEGER NOT NULL DEFAULT 0,
    ingested_at TEXT NOT NULL
);

-- Faces: one observation per detected face
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL NOT NULL,
    embedding BLOB NOT NULL,            -- little-endian f32 array
    embedding_dim INTEGER NOT NULL,
    engine_name TEXT NOT NULL,
    metric TEXT NOT NULL,               -- 'cosine' or 'euclidean'
    FOREIGN KEY (photo_id) REFERENCES photos(photo_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);

-- Person groups
CREATE TABLE IF NOT EXISTS face_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    representative_face_id INTEGER NOT NULL,
    engine_name TEXT NOT NULL,
    metric TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (representative_face_id) REFERENCES faces(id) ON DELETE CASCADE
);

-- Membership: face_id is the key, so every face is in at most one group
CREATE TABLE IF NOT EXISTS group_members (
    face_id INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL,
    score REAL NOT NULL,                -- against the representative
    FOREIGN KEY (face_id) REFERENCES faces(id) ON DELETE CASCADE,
    FOREIGN KEY (group_id) REFERENCES face_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_group ON group_members(group_id);

-- Small key/value settings, e.g. threshold overrides
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
