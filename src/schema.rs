diesel::table! {
    datasets (id) {
        id -> Text,
        name -> Text,
        row_count -> Int8,
        column_count -> Int8,
        #[sql_name = "columns"]
        column_names -> Jsonb,
        dtypes -> Jsonb,
        data_preview -> Jsonb,
        storage_type -> Text,
        offload_ref -> Nullable<Text>,
        inline_data -> Nullable<Binary>,
        source_type -> Text,
        source_config -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    training_metadata (id) {
        id -> Text,
        dataset_id -> Text,
        workspace_name -> Nullable<Text>,
        model_name -> Text,
        model_type -> Text,
        target_variable -> Text,
        features -> Jsonb,
        metrics -> Jsonb,
        hyperparameters -> Jsonb,
        feature_importance -> Jsonb,
        training_time -> Float8,
        is_best -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workspace_states (id) {
        id -> Text,
        workspace_name -> Text,
        dataset_id -> Text,
        storage_type -> Text,
        offload_ref -> Nullable<Text>,
        inline_data -> Nullable<Binary>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    blobs (blob_ref) {
        blob_ref -> Text,
        size_bytes -> Int8,
        chunk_count -> Int4,
        complete -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    blob_chunks (blob_ref, seq) {
        blob_ref -> Text,
        seq -> Int4,
        data -> Binary,
    }
}

diesel::joinable!(training_metadata -> datasets (dataset_id));
diesel::joinable!(workspace_states -> datasets (dataset_id));
diesel::joinable!(blob_chunks -> blobs (blob_ref));

diesel::allow_tables_to_appear_in_same_query!(
    datasets,
    training_metadata,
    workspace_states,
    blobs,
    blob_chunks,
);
