pub(super) const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    request TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'failed')),
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    last_log_at TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_id ON jobs(status, id);

CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    step_index INTEGER NOT NULL,
    goal TEXT NOT NULL,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    scope TEXT NOT NULL DEFAULT 'repo',
    constraints TEXT NOT NULL DEFAULT '[]',
    file_allowlist TEXT NOT NULL DEFAULT '[]',
    command_allowlist TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'failed')),
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    report_path TEXT,
    error TEXT,
    UNIQUE (job_id, step_index)
);

CREATE INDEX IF NOT EXISTS idx_steps_claim ON steps(job_id, status, step_index);

CREATE TABLE IF NOT EXISTS subtasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    step_id INTEGER NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
    subtask_index INTEGER NOT NULL,
    title TEXT NOT NULL,
    instruction TEXT NOT NULL,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    scope TEXT NOT NULL DEFAULT 'repo',
    constraints TEXT NOT NULL DEFAULT '[]',
    file_allowlist TEXT NOT NULL DEFAULT '[]',
    command_allowlist TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'failed')),
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    report_path TEXT,
    error TEXT,
    UNIQUE (step_id, subtask_index)
);

CREATE INDEX IF NOT EXISTS idx_subtasks_claim ON subtasks(step_id, status, subtask_index);
"#;
