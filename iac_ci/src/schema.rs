//! Diesel table definitions for the run store.
//!
//! Tables: iac_ci_runs, iac_ci_settings. Each row keeps the full record as
//! JSONB next to the columns it is looked up by.

diesel::table! {
    iac_ci_runs (id) {
        id -> Text,
        trigger_id -> Text,
        build_id -> Nullable<Text>,
        build_status -> Varchar,
        doc -> Jsonb,
        write_date -> Timestamptz,
    }
}

diesel::table! {
    iac_ci_settings (id) {
        id -> Text,
        repo_name -> Text,
        doc -> Jsonb,
        write_date -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(iac_ci_runs, iac_ci_settings);
