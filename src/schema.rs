table! {
    churches (id) {
        id -> Integer,
        name -> Text,
    }
}

table! {
    accounts (id) {
        id -> Integer,
        name -> Text,
        role -> Text,
        church_id -> Nullable<Integer>,
        api_token -> Text,
    }
}

table! {
    events (id) {
        id -> Integer,
        title -> Text,
        description -> Nullable<Text>,
        location -> Nullable<Text>,
        link -> Nullable<Text>,
        start_time -> Timestamp,
        end_time -> Timestamp,
        organizer_id -> Integer,
        church_id -> Nullable<Integer>,
        cancelled_at -> Nullable<Timestamp>,
        cancellation_reason -> Nullable<Text>,
        cancelled_by -> Nullable<Integer>,
        interested_count -> Integer,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    interests (event_id, device_id) {
        event_id -> Integer,
        device_id -> Text,
        created_at -> Timestamp,
    }
}

table! {
    devices (device_id) {
        device_id -> Text,
        push_token -> Text,
        platform -> Text,
        updated_at -> Timestamp,
    }
}

joinable!(accounts -> churches (church_id));
joinable!(events -> churches (church_id));
joinable!(interests -> events (event_id));

allow_tables_to_appear_in_same_query!(churches, accounts, events, interests, devices,);
