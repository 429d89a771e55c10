//! SQL schema for the roster SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS patients (
    patient_id     TEXT PRIMARY KEY,
    registry_id    TEXT UNIQUE,      -- NULL until resolved
    given_name     TEXT NOT NULL,
    family_name    TEXT NOT NULL,
    date_of_birth  TEXT NOT NULL,    -- YYYY-MM-DD
    postcode       TEXT,
    invalidated_at TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

-- ── Dependent entities ────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS group_memberships (
    membership_id TEXT PRIMARY KEY,
    patient_id    TEXT NOT NULL REFERENCES patients(patient_id),
    group_id      TEXT NOT NULL,
    period        INTEGER NOT NULL,
    UNIQUE (patient_id, group_id, period)
);

-- Assessments and pre-screenings recorded against one membership.
CREATE TABLE IF NOT EXISTS membership_decisions (
    decision_id   TEXT PRIMARY KEY,
    membership_id TEXT NOT NULL REFERENCES group_memberships(membership_id),
    kind          TEXT NOT NULL,
    recorded_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consents (
    consent_id  TEXT PRIMARY KEY,
    patient_id  TEXT NOT NULL REFERENCES patients(patient_id),
    response    TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS triages (
    triage_id   TEXT PRIMARY KEY,
    patient_id  TEXT NOT NULL REFERENCES patients(patient_id),
    status      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vaccination_records (
    record_id       TEXT PRIMARY KEY,
    patient_id      TEXT NOT NULL REFERENCES patients(patient_id),
    vaccine         TEXT NOT NULL,
    administered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS guardian_relationships (
    relationship_id TEXT PRIMARY KEY,
    patient_id      TEXT NOT NULL REFERENCES patients(patient_id),
    guardian_id     TEXT NOT NULL,
    UNIQUE (patient_id, guardian_id)
);

-- ── Imports ───────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS imports (
    import_id    TEXT PRIMARY KEY,
    status       TEXT NOT NULL,      -- 'pending' | 'finalizing' | 'committed' | 'rejected'
    row_count    INTEGER NOT NULL,
    match_rate   REAL,
    rejection    TEXT,               -- JSON-encoded Rejection or NULL
    created_at   TEXT NOT NULL,
    processed_at TEXT
);

CREATE TABLE IF NOT EXISTS import_patients (
    import_id  TEXT NOT NULL REFERENCES imports(import_id),
    patient_id TEXT NOT NULL REFERENCES patients(patient_id),
    PRIMARY KEY (import_id, patient_id)
);

CREATE TABLE IF NOT EXISTS changesets (
    changeset_id         TEXT PRIMARY KEY,
    import_id            TEXT NOT NULL REFERENCES imports(import_id),
    row_number           INTEGER NOT NULL,
    given_name           TEXT NOT NULL,
    family_name          TEXT NOT NULL,
    date_of_birth        TEXT NOT NULL,
    postcode             TEXT,
    uploaded_registry_id TEXT,
    status               TEXT NOT NULL,
    resolution           TEXT,       -- JSON-encoded Resolution or NULL
    search_results       TEXT NOT NULL DEFAULT '[]',
    staged_registry_id   TEXT,
    invalid_reason       TEXT,
    patient_id           TEXT REFERENCES patients(patient_id),
    UNIQUE (import_id, row_number)
);

-- ── Audit trail ───────────────────────────────────────────────────────────

-- Append-only. Rows only ever change owner, during a merge.
CREATE TABLE IF NOT EXISTS search_results (
    result_id   TEXT PRIMARY KEY,
    patient_id  TEXT NOT NULL REFERENCES patients(patient_id),
    import_id   TEXT REFERENCES imports(import_id),
    step        TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    registry_id TEXT,
    created_at  TEXT NOT NULL,
    run_id      TEXT NOT NULL,       -- one pass through the cascade
    position    INTEGER NOT NULL,    -- index within that run's history
    UNIQUE (run_id, position)
);

-- Outbox; drained by downstream publishers.
CREATE TABLE IF NOT EXISTS events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS memberships_patient_idx ON group_memberships(patient_id);
CREATE INDEX IF NOT EXISTS decisions_membership_idx ON membership_decisions(membership_id);
CREATE INDEX IF NOT EXISTS changesets_import_idx   ON changesets(import_id);
CREATE INDEX IF NOT EXISTS results_patient_idx     ON search_results(patient_id);

PRAGMA user_version = 1;
";
