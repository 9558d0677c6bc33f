// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Ordered schema migrations.
//!
//! Each migration runs once, inside a transaction, in ascending version
//! order; `PRAGMA user_version` records the highest applied version.

/// `01`: valid store objects and the reference graph.
const MIGRATION_01: &str = r#"
create table store_objects (
    path     text primary key not null,
    ca       text not null,
    nar_hash text not null,
    nar_size integer not null,
    registered_at integer not null
);

create table refs (
    referrer  text not null,
    reference text not null,
    primary key (referrer, reference),
    foreign key (referrer) references store_objects(path) on delete cascade,
    foreign key (reference) references store_objects(path) on delete restrict
);

create index idx_refs_reference on refs(reference);
"#;

/// `02`: build outcomes.
const MIGRATION_02: &str = r#"
create table realizations (
    drv_path    text not null,
    output_name text not null,
    store_path  text not null,
    timestamp   integer not null,
    primary key (drv_path, output_name),
    foreign key (store_path) references store_objects(path) on delete cascade
);

create index idx_realizations_store_path on realizations(store_path);

create table build_log (
    id           integer primary key autoincrement not null,
    drv_path     text not null,
    started_at   integer not null,
    ended_at     integer,
    status       text not null,
    log_blob_ref text
);

create index idx_build_log_drv_path on build_log(drv_path);
"#;

/// All migrations in application order.
pub(crate) const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_01), (2, MIGRATION_02)];
