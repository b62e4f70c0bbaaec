//! Diesel table definitions for the culprit-finding store.
//!
//! Tables: culprit_analyses, culprit_failure_groups, culprit_try_jobs,
//! culprit_try_job_ids, culprit_flake_aggregates. Each entity keeps its full
//! record in `body`; columns outside `body` exist for lookups and for the
//! try-job compare-and-create.

diesel::table! {
    culprit_analyses (project, builder, build_number, kind) {
        project -> Varchar,
        builder -> Varchar,
        build_number -> Int8,
        kind -> Varchar,
        status -> Varchar,
        body -> Jsonb,
        create_date -> Timestamptz,
        write_date -> Timestamptz,
    }
}

diesel::table! {
    culprit_failure_groups (id) {
        id -> Uuid,
        project -> Varchar,
        kind -> Varchar,
        signature -> Jsonb,
        body -> Jsonb,
        create_date -> Timestamptz,
        write_date -> Timestamptz,
    }
}

diesel::table! {
    culprit_try_jobs (project, builder, build_number, kind) {
        project -> Varchar,
        builder -> Varchar,
        build_number -> Int8,
        kind -> Varchar,
        attempt -> Int4,
        status -> Varchar,
        error -> Nullable<Text>,
        body -> Jsonb,
        create_date -> Timestamptz,
        write_date -> Timestamptz,
    }
}

diesel::table! {
    culprit_try_job_ids (try_job_id) {
        try_job_id -> Varchar,
        project -> Varchar,
        builder -> Varchar,
        build_number -> Int8,
        kind -> Varchar,
    }
}

diesel::table! {
    culprit_flake_aggregates (flake_key) {
        flake_key -> Varchar,
        score -> Int8,
        body -> Jsonb,
        write_date -> Timestamptz,
    }
}
