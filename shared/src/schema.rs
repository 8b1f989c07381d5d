diesel::table! {
    events (id) {
        id -> Uuid,
        organization_id -> Uuid,
        name -> Varchar,
    }
}

diesel::table! {
    organizations (id) {
        id -> Uuid,
        network_id -> Uuid,
        name -> Varchar,
    }
}

diesel::table! {
    releases (id) {
        id -> Uuid,
        event_id -> Uuid,
        name -> Varchar,
        open_at -> Timestamptz,
        close_at -> Timestamptz,
        tickets_available -> Int4,
        method -> Varchar,
        open_window_duration -> Int4,
        max_tickets_per_user -> Int4,
        has_allocated -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_types (id) {
        id -> Uuid,
        release_id -> Uuid,
        name -> Varchar,
        price -> Numeric,
        quantity_total -> Int4,
    }
}

diesel::table! {
    ticket_requests (id) {
        id -> Uuid,
        release_id -> Uuid,
        ticket_type_id -> Uuid,
        user_id -> Uuid,
        amount -> Int4,
        is_handled -> Bool,
        is_after_window -> Bool,
        created_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        release_id -> Uuid,
        request_id -> Uuid,
        ticket_type_id -> Uuid,
        user_id -> Uuid,
        is_reserve -> Bool,
        reserve_number -> Nullable<Int4>,
        is_paid -> Bool,
        purchasable_at -> Nullable<Timestamptz>,
        order_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_id -> Varchar,
        merchant_id -> Varchar,
        store_id -> Varchar,
        user_id -> Uuid,
        email -> Varchar,
        payment_page_link -> Varchar,
        total -> Numeric,
        currency -> Varchar,
        status -> Varchar,
        payment_id -> Nullable<Varchar>,
        payment_method -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_events (id) {
        id -> Uuid,
        event_id -> Varchar,
        order_id -> Varchar,
        event_type -> Varchar,
        retry_attempt -> Int4,
        payload -> Jsonb,
        received_at -> Timestamptz,
    }
}

diesel::table! {
    merchants (id) {
        id -> Uuid,
        network_id -> Uuid,
        application_id -> Varchar,
        application_status -> Varchar,
        web_kyb_url -> Nullable<Varchar>,
        merchant_id -> Nullable<Varchar>,
        default_store_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stores (id) {
        id -> Uuid,
        merchant_id -> Varchar,
        organization_id -> Uuid,
        store_id -> Varchar,
        terminal_id -> Nullable<Varchar>,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(releases -> events (event_id));
diesel::joinable!(ticket_types -> releases (release_id));
diesel::joinable!(ticket_requests -> releases (release_id));
diesel::joinable!(tickets -> ticket_types (ticket_type_id));

diesel::allow_tables_to_appear_in_same_query!(
    events,
    organizations,
    releases,
    ticket_types,
    ticket_requests,
    tickets,
    orders,
    webhook_events,
    merchants,
    stores,
    outbox_events,
);
