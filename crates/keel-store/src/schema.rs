//! Aggregate store database schema.

/// SQL to create the aggregate state table.
pub const CREATE_AGGREGATES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_aggregates (
    aggregate_type  VARCHAR(255) NOT NULL,
    aggregate_id    VARCHAR(255) NOT NULL,
    version         BIGINT NOT NULL,
    sequence        BIGINT NOT NULL,
    phase           VARCHAR(32) NOT NULL,
    state           JSONB NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (aggregate_type, aggregate_id)
);
";

/// SQL to create the extracted message table.
pub const CREATE_MESSAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_messages (
    message_id         UUID PRIMARY KEY,
    message_type       VARCHAR(255) NOT NULL,
    aggregate_type     VARCHAR(255) NOT NULL,
    aggregate_id       VARCHAR(255) NOT NULL,
    aggregate_version  BIGINT NOT NULL,
    sequence_number    BIGINT NOT NULL,
    phase              VARCHAR(32) NOT NULL,
    effect_immediately BOOLEAN NOT NULL,
    queue              VARCHAR(255),
    tracking_token     VARCHAR(255),
    correlation_id     UUID,
    payload            JSONB NOT NULL,
    occurred_at        TIMESTAMPTZ NOT NULL,
    UNIQUE (aggregate_type, aggregate_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_keel_messages_aggregate
    ON keel_messages (aggregate_type, aggregate_id, sequence_number);

CREATE INDEX IF NOT EXISTS idx_keel_messages_tracking
    ON keel_messages (queue, tracking_token);
";
