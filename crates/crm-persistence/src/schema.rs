//! Esquema Diesel de las tablas de sistema (prefijo reservado `_system_`).
//! Mantenido a mano en paralelo con las migraciones; reemplazable con
//! `diesel print-schema`.
//!
//! Las tablas de objetos de usuario no se declaran aquí: su forma es dinámica
//! y se accede vía `sql_query` en `record_repo`.

diesel::table! {
    _system_object (id) {
        id -> Uuid,
        api_name -> Text,
        label -> Text,
        plural_label -> Text,
        description -> Nullable<Text>,
        is_custom -> Bool,
        sharing_model -> Text,
        app_id -> Nullable<Uuid>,
        table_type -> Nullable<Text>,
        list_fields -> Nullable<Jsonb>,
        icon -> Nullable<Text>,
        created_date -> Timestamptz,
    }
}

diesel::table! {
    _system_field (id) {
        id -> Uuid,
        object_api_name -> Text,
        api_name -> Text,
        label -> Text,
        field_type -> Text,
        required -> Bool,
        is_unique -> Bool,
        default_value -> Nullable<Jsonb>,
        help_text -> Nullable<Text>,
        is_system -> Bool,
        is_name_field -> Bool,
        options -> Nullable<Jsonb>,
        min_length -> Nullable<Integer>,
        max_length -> Nullable<Integer>,
        min_value -> Nullable<Double>,
        max_value -> Nullable<Double>,
        regex -> Nullable<Text>,
        regex_message -> Nullable<Text>,
        reference_to -> Nullable<Jsonb>,
        is_master_detail -> Bool,
        delete_rule -> Nullable<Text>,
        relationship_name -> Nullable<Text>,
        formula -> Nullable<Text>,
        return_type -> Nullable<Text>,
        rollup_config -> Nullable<Jsonb>,
        validator -> Nullable<Text>,
        validator_config -> Nullable<Jsonb>,
    }
}

diesel::table! {
    _system_table (table_name) {
        table_name -> Text,
        object_api_name -> Text,
        created_date -> Timestamptz,
    }
}

diesel::table! {
    _system_flow (id) {
        id -> Uuid,
        name -> Text,
        trigger_object -> Text,
        trigger_type -> Text,
        trigger_condition -> Nullable<Text>,
        flow_type -> Text,
        action_type -> Nullable<Text>,
        action_config -> Nullable<Jsonb>,
        status -> Text,
        schedule -> Nullable<Text>,
        schedule_timezone -> Nullable<Text>,
        next_run_at -> Nullable<Timestamptz>,
        last_run_at -> Nullable<Timestamptz>,
        is_running -> Nullable<Bool>,
    }
}

diesel::table! {
    _system_flow_step (id) {
        id -> Uuid,
        flow_id -> Uuid,
        name -> Text,
        step_order -> Integer,
        step_type -> Text,
        action_type -> Nullable<Text>,
        action_config -> Nullable<Jsonb>,
        on_success_step -> Nullable<Uuid>,
        on_failure_step -> Nullable<Uuid>,
    }
}

diesel::table! {
    _system_flow_instance (id) {
        id -> Uuid,
        flow_id -> Uuid,
        object_api_name -> Text,
        record_id -> Uuid,
        status -> Text,
        current_step_id -> Nullable<Uuid>,
        started_date -> Timestamptz,
        paused_date -> Nullable<Timestamptz>,
        completed_date -> Nullable<Timestamptz>,
        context_data -> Nullable<Jsonb>,
    }
}

diesel::table! {
    _system_approval_work_item (id) {
        id -> Uuid,
        process_id -> Nullable<Uuid>,
        object_api_name -> Text,
        record_id -> Uuid,
        status -> Text,
        submitted_by_id -> Uuid,
        approver_id -> Uuid,
        flow_instance_id -> Nullable<Uuid>,
        flow_step_id -> Nullable<Uuid>,
        comments -> Nullable<Text>,
        submitted_date -> Timestamptz,
        approved_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    _system_validation_rule (id) {
        id -> Uuid,
        object_api_name -> Text,
        name -> Text,
        condition -> Text,
        error_message -> Text,
        active -> Bool,
    }
}

diesel::table! {
    _system_auto_number (id) {
        id -> Uuid,
        object_api_name -> Text,
        field_api_name -> Text,
        display_format -> Text,
        current_number -> BigInt,
    }
}

diesel::table! {
    _system_role (id) {
        id -> Uuid,
        name -> Text,
        parent_role_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    _system_profile (id) {
        id -> Uuid,
        name -> Text,
        is_admin -> Bool,
    }
}

diesel::table! {
    _system_permission_set (id) {
        id -> Uuid,
        name -> Text,
    }
}

diesel::table! {
    _system_permission_set_assignment (id) {
        id -> Uuid,
        user_id -> Uuid,
        permission_set_id -> Uuid,
    }
}

diesel::table! {
    _system_object_perms (id) {
        id -> Uuid,
        profile_id -> Nullable<Uuid>,
        permission_set_id -> Nullable<Uuid>,
        object_api_name -> Text,
        can_read -> Bool,
        can_create -> Bool,
        can_edit -> Bool,
        can_delete -> Bool,
    }
}

diesel::table! {
    _system_field_perms (id) {
        id -> Uuid,
        profile_id -> Nullable<Uuid>,
        permission_set_id -> Nullable<Uuid>,
        object_api_name -> Text,
        field_api_name -> Text,
        can_read -> Bool,
        can_edit -> Bool,
    }
}

diesel::table! {
    _system_sharing_rule (id) {
        id -> Uuid,
        object_api_name -> Text,
        criteria -> Nullable<Text>,
        access_level -> Text,
        share_with_role_id -> Nullable<Uuid>,
        share_with_user_id -> Nullable<Uuid>,
        share_with_group_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    _system_record_share (id) {
        id -> Uuid,
        object_api_name -> Text,
        record_id -> Uuid,
        user_id -> Nullable<Uuid>,
        group_id -> Nullable<Uuid>,
        access_level -> Text,
    }
}

diesel::table! {
    _system_team_member (id) {
        id -> Uuid,
        object_api_name -> Text,
        record_id -> Uuid,
        user_id -> Uuid,
        access_level -> Text,
    }
}

diesel::table! {
    _system_group (id) {
        id -> Uuid,
        name -> Text,
    }
}

diesel::table! {
    _system_group_member (id) {
        id -> Uuid,
        group_id -> Uuid,
        member_id -> Uuid,
    }
}

diesel::table! {
    _system_audit_log (id) {
        id -> BigInt,
        object_api_name -> Text,
        record_id -> Uuid,
        field_api_name -> Text,
        old_value -> Nullable<Text>,
        new_value -> Nullable<Text>,
        changed_by_id -> Uuid,
        changed_date -> Timestamptz,
    }
}

diesel::table! {
    _system_recycle_bin (record_id) {
        record_id -> Uuid,
        object_api_name -> Text,
        deleted_by_id -> Uuid,
        deleted_date -> Timestamptz,
    }
}

diesel::table! {
    _system_outbox_event (id) {
        id -> Uuid,
        event_type -> Text,
        payload -> Jsonb,
        status -> Text,
        retry_count -> Integer,
        error_message -> Nullable<Text>,
        created_date -> Timestamptz,
        processed_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    _system_user (id) {
        id -> Uuid,
        username -> Text,
        password_hash -> Nullable<Text>,
        profile_id -> Nullable<Uuid>,
        role_id -> Nullable<Uuid>,
        is_active -> Bool,
        created_date -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(_system_object,
                                              _system_field,
                                              _system_table,
                                              _system_flow,
                                              _system_flow_step,
                                              _system_flow_instance,
                                              _system_approval_work_item,
                                              _system_validation_rule,
                                              _system_auto_number,
                                              _system_role,
                                              _system_profile,
                                              _system_permission_set,
                                              _system_permission_set_assignment,
                                              _system_object_perms,
                                              _system_field_perms,
                                              _system_sharing_rule,
                                              _system_record_share,
                                              _system_team_member,
                                              _system_group,
                                              _system_group_member,
                                              _system_audit_log,
                                              _system_recycle_bin,
                                              _system_outbox_event,
                                              _system_user,);
