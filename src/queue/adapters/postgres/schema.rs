//! Diesel schema for build and task persistence.

diesel::table! {
    /// Failed CI builds under remediation.
    builds (id) {
        /// Internal build identifier.
        id -> Uuid,
        /// CI job name.
        #[max_length = 255]
        job -> Varchar,
        /// CI build number, unique per job.
        build_number -> Int8,
        /// Branch the failure occurred on.
        #[max_length = 255]
        branch -> Nullable<Varchar>,
        /// Repository URL.
        repo_url -> Nullable<Text>,
        /// Failing commit SHA.
        #[max_length = 64]
        commit_sha -> Nullable<Varchar>,
        /// Build lifecycle status.
        #[max_length = 20]
        status -> Varchar,
        /// Original failure report.
        payload -> Jsonb,
        /// Creation timestamp.
        created_at -> Timestamptz,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Pipeline stage tasks.
    tasks (id) {
        /// Internal task identifier.
        id -> Uuid,
        /// Owning build.
        build_id -> Uuid,
        /// Pipeline stage tag.
        #[sql_name = "type"]
        #[max_length = 64]
        task_type -> Varchar,
        /// Task lifecycle status.
        #[max_length = 20]
        status -> Varchar,
        /// Attempts consumed.
        attempt -> Int4,
        /// Attempt budget.
        max_attempts -> Int4,
        /// Accumulated stage payload.
        payload -> Jsonb,
        /// Latest failure description.
        error_message -> Nullable<Text>,
        /// Earliest claim time while waiting on backoff.
        available_at -> Nullable<Timestamptz>,
        /// Creation timestamp.
        created_at -> Timestamptz,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(tasks -> builds (build_id));
diesel::allow_tables_to_appear_in_same_query!(builds, tasks);
