table! {
    bso (user_id, collection_id, id) {
        #[sql_name = "userid"]
        user_id -> BigInt,
        #[sql_name = "collection"]
        collection_id -> Integer,
        id -> Text,
        sortindex -> Nullable<Integer>,
        payload -> Text,
        modified -> BigInt,
        #[sql_name = "ttl"]
        expiry -> BigInt,
    }
}

table! {
    collections (id) {
        id -> Integer,
        name -> Text,
    }
}

table! {
    user_collections (user_id, collection_id) {
        #[sql_name = "userid"]
        user_id -> BigInt,
        #[sql_name = "collection"]
        collection_id -> Integer,
        #[sql_name = "last_modified"]
        modified -> BigInt,
        total_bytes -> Nullable<BigInt>,
        count -> Nullable<Integer>,
    }
}

table! {
    batch_uploads (batch_id, user_id) {
        #[sql_name = "batch"]
        batch_id -> BigInt,
        #[sql_name = "userid"]
        user_id -> BigInt,
        #[sql_name = "collection"]
        collection_id -> Integer,
    }
}

table! {
    batch_upload_items (batch_id, user_id, id) {
        #[sql_name = "batch"]
        batch_id -> BigInt,
        #[sql_name = "userid"]
        user_id -> BigInt,
        id -> Text,
        sortindex -> Nullable<Integer>,
        payload -> Nullable<Text>,
        payload_size -> Nullable<BigInt>,
        ttl_offset -> Nullable<Integer>,
    }
}
