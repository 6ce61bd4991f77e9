//! Key expansion: the fixpoint engine that turns declared key member lists
//! into flat column lists, synthesizing foreign-key columns along the way.
//!
//! Expansion runs in bounded passes over every key that has not reached
//! `Expanded`:
//!
//! - A foreign key waits for its *target* key to expand, then synthesizes
//!   one mirror column per target column on the referencing entity.
//! - Any other key first resolves its declared member names
//!   (`Listed → Assigned`), then expands: columns pass through, reference
//!   members contribute the already-expanded columns of their own foreign
//!   key — which a later pass provides, as long as there is no true cycle.
//!
//! Keys still unexpanded when the passes run out are reported as circular
//! references; that is the only cycle detection there is. Include columns of
//! indexes resolve in a single pass afterwards, and key names are
//! synthesized last.

use crate::graph::{
    ColumnDef, EntityId, EntityInfo, ExpandedKeyMember, KeyMember, KeyStatus, KeyType, MemberInfo,
    MemberKind,
};
use relmodel_core::{AutoValueKind, DataKind, SchemaFaultKind, SchemaFaults};

/// Parse a member-list spec (`"A,B:desc"`) into ordered `(name, desc)`
/// pairs. Empty segments are skipped; the direction suffix is
/// case-insensitive.
pub(crate) fn parse_member_spec(spec: &str) -> Vec<(String, bool)> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|part| match part.split_once(':') {
            Some((name, dir)) => (
                name.trim().to_string(),
                dir.trim().eq_ignore_ascii_case("desc"),
            ),
            None => (part.to_string(), false),
        })
        .collect()
}

/// Run expansion to a fixpoint over all keys of all entities.
pub(crate) fn expand_keys(
    entities: &mut Vec<EntityInfo>,
    max_passes: usize,
    faults: &mut SchemaFaults,
) {
    seed(entities, faults);

    for pass in 1..=max_passes {
        let mut progress = false;
        let mut remaining = 0usize;

        for ei in 0..entities.len() {
            for ki in 0..entities[ei].keys.len() {
                let key = &entities[ei].keys[ki];
                if key.status == KeyStatus::Expanded || key.failed {
                    continue;
                }
                let stepped = match key.key_type {
                    KeyType::ForeignKey => try_expand_foreign_key(entities, ei, ki, faults),
                    _ => try_expand_plain(entities, ei, ki, faults),
                };
                progress |= stepped;

                let key = &entities[ei].keys[ki];
                if key.status != KeyStatus::Expanded && !key.failed {
                    remaining += 1;
                }
            }
        }

        tracing::debug!(pass, remaining, "key expansion pass");
        if remaining == 0 || !progress {
            break;
        }
    }

    report_unexpanded(entities, max_passes, faults);
    expand_includes(entities, faults);
    assign_key_names(entities);
}

/// Build each key's declared member list from its owning member or spec
/// string.
fn seed(entities: &mut [EntityInfo], faults: &mut SchemaFaults) {
    for entity in entities.iter_mut() {
        for key in &mut entity.keys {
            if !key.key_members.is_empty() {
                continue;
            }
            if let Some(owner) = key.owner_member {
                key.key_members = vec![KeyMember {
                    name: entity.members[owner].name.clone(),
                    member: Some(owner),
                    desc: false,
                }];
                key.status = KeyStatus::Assigned;
            } else if let Some(spec) = key.spec.clone() {
                key.key_members = parse_member_spec(&spec)
                    .into_iter()
                    .map(|(name, desc)| KeyMember {
                        name,
                        member: None,
                        desc,
                    })
                    .collect();
                if key.key_members.is_empty() && key.key_type == KeyType::PrimaryKey {
                    faults.add_key(
                        &entity.name,
                        &spec,
                        SchemaFaultKind::EmptyPrimaryKey,
                        "primary key has no members",
                    );
                    key.failed = true;
                }
            }
        }
    }
}

/// One expansion step for a non-foreign key: resolve remaining member names,
/// then expand once every member is a column or a reference with an expanded
/// foreign key. Returns whether any state changed.
fn try_expand_plain(
    entities: &mut [EntityInfo],
    ei: usize,
    ki: usize,
    faults: &mut SchemaFaults,
) -> bool {
    // Resolve outstanding member names against the entity.
    let resolutions: Vec<Option<usize>> = {
        let entity = &entities[ei];
        entity.keys[ki]
            .key_members
            .iter()
            .map(|km| km.member.or_else(|| entity.member_index(&km.name)))
            .collect()
    };

    let mut changed = false;
    {
        let key = &mut entities[ei].keys[ki];
        for (km, res) in key.key_members.iter_mut().zip(&resolutions) {
            if km.member.is_none() && res.is_some() {
                km.member = *res;
                changed = true;
            }
        }
        if key.status == KeyStatus::Listed
            && !key.key_members.is_empty()
            && key.key_members.iter().all(|km| km.member.is_some())
        {
            key.status = KeyStatus::Assigned;
            changed = true;
        }
    }
    if entities[ei].keys[ki].status != KeyStatus::Assigned {
        return changed;
    }

    // Attempt expansion. A reference member defers the whole key until its
    // own foreign key has expanded.
    enum Step {
        Done(Vec<ExpandedKeyMember>),
        Defer,
        Fail(String),
    }

    let step = {
        let entity = &entities[ei];
        let key = &entity.keys[ki];
        let mut out = Vec::new();
        let mut step = None;
        for km in &key.key_members {
            let mi = km.member.expect("assigned key member");
            match &entity.members[mi].kind {
                MemberKind::Column(_) => out.push(ExpandedKeyMember {
                    member: mi,
                    desc: km.desc,
                }),
                MemberKind::EntityRef(r) => {
                    let fk = &entity.keys[r.from_key];
                    if fk.status == KeyStatus::Expanded {
                        out.extend(fk.expanded.iter().map(|em| ExpandedKeyMember {
                            member: em.member,
                            desc: km.desc,
                        }));
                    } else {
                        step = Some(Step::Defer);
                        break;
                    }
                }
                MemberKind::EntityList(_) => {
                    step = Some(Step::Fail(format!(
                        "list member '{}' cannot be part of a key",
                        entity.members[mi].name
                    )));
                    break;
                }
            }
        }
        step.unwrap_or(Step::Done(out))
    };

    match step {
        Step::Done(expanded) => {
            let key = &mut entities[ei].keys[ki];
            key.expanded = expanded;
            key.status = KeyStatus::Expanded;
            true
        }
        Step::Defer => changed,
        Step::Fail(message) => {
            let name = key_label(&entities[ei], ki);
            faults.add_key(&entities[ei].name, name, SchemaFaultKind::Invalid, message);
            entities[ei].keys[ki].failed = true;
            true
        }
    }
}

/// One expansion step for a foreign key: once the target key is expanded,
/// synthesize the mirror columns on the referencing entity. Returns whether
/// any state changed.
fn try_expand_foreign_key(
    entities: &mut [EntityInfo],
    ei: usize,
    ki: usize,
    faults: &mut SchemaFaults,
) -> bool {
    let (target, tk, ref_nullable, ref_name) = {
        let entity = &entities[ei];
        let owner = entity.keys[ki].owner_member.expect("foreign keys have an owner");
        let Some(r) = entity.members[owner].as_reference() else {
            let name = key_label(entity, ki);
            faults.add_key(
                &entity.name,
                name,
                SchemaFaultKind::Invalid,
                "foreign key owner is not a reference member",
            );
            entities[ei].keys[ki].failed = true;
            return true;
        };
        (
            r.to_key.0,
            r.to_key.1,
            r.nullable,
            entity.members[owner].name.clone(),
        )
    };

    if entities[target.0].keys[tk].status != KeyStatus::Expanded {
        return false;
    }

    // Snapshot what the target contributes before mutating the source
    // entity; source and target may be the same entity (self-reference).
    let target_cols: Vec<(String, DataKind, Option<u32>, AutoValueKind)> = {
        let te = &entities[target.0];
        te.keys[tk]
            .expanded
            .iter()
            .map(|em| {
                let m = &te.members[em.member];
                let c = m.as_column().expect("expanded key members are columns");
                (m.name.clone(), c.data_kind, c.size, c.auto)
            })
            .collect()
    };

    let overrides = entities[ei].keys[ki].fk_column_names.clone();
    if let Some(ov) = &overrides {
        if ov.len() != target_cols.len() {
            let name = key_label(&entities[ei], ki);
            faults.add_key(
                &entities[ei].name,
                name,
                SchemaFaultKind::ColumnCountMismatch,
                format!(
                    "{} explicit column names for a {}-column target key",
                    ov.len(),
                    target_cols.len()
                ),
            );
            entities[ei].keys[ki].failed = true;
            return true;
        }
    }

    let mut expanded = Vec::with_capacity(target_cols.len());
    for (i, (target_col, kind, size, auto)) in target_cols.iter().enumerate() {
        let col_name = overrides
            .as_ref()
            .map_or_else(|| format!("{ref_name}_{target_col}"), |ov| ov[i].clone());

        match entities[ei].member_index(&col_name) {
            Some(mi) => {
                // Explicitly declared (or shared with another key): the type
                // must match the synthesized one exactly.
                match &mut entities[ei].members[mi].kind {
                    MemberKind::Column(c) => {
                        if c.data_kind != *kind || c.size != *size {
                            let found = c.data_kind;
                            faults.add_member(
                                entities[ei].name.clone(),
                                col_name,
                                SchemaFaultKind::ColumnTypeMismatch,
                                format!(
                                    "declared as {found}, foreign key for '{ref_name}' \
                                     requires {kind}"
                                ),
                            );
                            entities[ei].keys[ki].failed = true;
                            return true;
                        }
                        c.foreign_key = true;
                        expanded.push(ExpandedKeyMember {
                            member: mi,
                            desc: false,
                        });
                    }
                    _ => {
                        faults.add_member(
                            entities[ei].name.clone(),
                            col_name,
                            SchemaFaultKind::Invalid,
                            format!("'{ref_name}' needs a column of this name"),
                        );
                        entities[ei].keys[ki].failed = true;
                        return true;
                    }
                }
            }
            None => {
                let mut def = ColumnDef::new(*kind);
                def.size = *size;
                def.nullable = ref_nullable;
                def.foreign_key = true;
                // Identity carries over: the value arrives from the parent
                // row's backend-assigned key.
                if *auto == AutoValueKind::Identity {
                    def.auto = AutoValueKind::Identity;
                }
                entities[ei].members.push(MemberInfo {
                    name: col_name,
                    kind: MemberKind::Column(def),
                });
                expanded.push(ExpandedKeyMember {
                    member: entities[ei].members.len() - 1,
                    desc: false,
                });
            }
        }
    }

    let key = &mut entities[ei].keys[ki];
    key.expanded = expanded;
    key.status = KeyStatus::Expanded;
    tracing::trace!(
        entity = %entities[ei].name,
        reference = %ref_name,
        columns = entities[ei].keys[ki].expanded.len(),
        "foreign key expanded"
    );
    true
}

/// Report every key that never reached `Expanded`: unresolved member names
/// are called out individually, everything else is a circular reference.
fn report_unexpanded(entities: &[EntityInfo], max_passes: usize, faults: &mut SchemaFaults) {
    for entity in entities {
        for (ki, key) in entity.keys.iter().enumerate() {
            if key.status == KeyStatus::Expanded || key.failed {
                continue;
            }

            let unknown: Vec<&str> = key
                .key_members
                .iter()
                .filter(|km| km.member.is_none() && entity.member_index(&km.name).is_none())
                .map(|km| km.name.as_str())
                .collect();

            if unknown.is_empty() {
                let pending: Vec<&str> = key
                    .key_members
                    .iter()
                    .filter_map(|km| {
                        let mi = km.member?;
                        let r = entity.members[mi].as_reference()?;
                        (entity.keys[r.from_key].status != KeyStatus::Expanded)
                            .then_some(entity.members[mi].name.as_str())
                    })
                    .collect();
                faults.add_key(
                    &entity.name,
                    key_label(entity, ki),
                    SchemaFaultKind::CircularReference,
                    if pending.is_empty() {
                        format!("key did not expand within {max_passes} passes")
                    } else {
                        format!(
                            "key did not expand within {max_passes} passes; \
                             circular reference through [{}]",
                            pending.join(", ")
                        )
                    },
                );
            } else {
                for name in unknown {
                    faults.add_key(
                        &entity.name,
                        key_label(entity, ki),
                        SchemaFaultKind::UnknownMember,
                        format!("unknown member '{name}'"),
                    );
                }
            }
        }
    }
}

/// Resolve index include-column specs. Runs once, after the fixpoint,
/// because reference members expand to their foreign-key columns.
fn expand_includes(entities: &mut [EntityInfo], faults: &mut SchemaFaults) {
    for ei in 0..entities.len() {
        for ki in 0..entities[ei].keys.len() {
            let Some(spec) = entities[ei].keys[ki].include_spec.clone() else {
                continue;
            };
            if entities[ei].keys[ki].failed {
                continue;
            }

            let mut members = Vec::new();
            for (name, _) in parse_member_spec(&spec) {
                let entity = &entities[ei];
                match entity.member_index(&name) {
                    Some(mi) => match &entity.members[mi].kind {
                        MemberKind::Column(_) => members.push(mi),
                        MemberKind::EntityRef(r) => {
                            let fk = &entity.keys[r.from_key];
                            if fk.status == KeyStatus::Expanded {
                                members.extend(fk.expanded.iter().map(|em| em.member));
                            }
                        }
                        MemberKind::EntityList(_) => {
                            faults.add_key(
                                &entity.name,
                                key_label(entity, ki),
                                SchemaFaultKind::Invalid,
                                format!("list member '{name}' cannot be an include column"),
                            );
                        }
                    },
                    None => {
                        faults.add_key(
                            &entity.name,
                            key_label(entity, ki),
                            SchemaFaultKind::UnknownMember,
                            format!("unknown include member '{name}'"),
                        );
                    }
                }
            }
            entities[ei].keys[ki].include_members = members;
        }
    }
}

/// Synthesize deterministic names for keys without explicit ones.
fn assign_key_names(entities: &mut [EntityInfo]) {
    for entity in entities.iter_mut() {
        let table = entity.table_name.clone();
        for key in &mut entity.keys {
            if key.name.is_some() {
                continue;
            }
            let name = match key.key_type {
                KeyType::PrimaryKey => format!("PK_{table}"),
                KeyType::ForeignKey => {
                    let owner = key
                        .key_members
                        .first()
                        .map_or("", |km| km.name.as_str());
                    format!("FK_{table}_{owner}")
                }
                KeyType::Index => {
                    let prefix = if key.clustered {
                        "IXC"
                    } else if key.unique {
                        "IXU"
                    } else {
                        "IX"
                    };
                    let members: Vec<&str> =
                        key.key_members.iter().map(|km| km.name.as_str()).collect();
                    format!("{prefix}_{table}_{}", members.join("_"))
                }
            };
            key.name = Some(name);
        }
    }
}

/// Human-readable label for a key during the build pass, before names are
/// assigned.
fn key_label(entity: &EntityInfo, ki: usize) -> String {
    let key = &entity.keys[ki];
    if let Some(name) = &key.name {
        return name.clone();
    }
    let prefix = match key.key_type {
        KeyType::PrimaryKey => "PK",
        KeyType::ForeignKey => "FK",
        KeyType::Index => "IX",
    };
    if let Some(owner) = key.owner_member {
        return format!("{prefix}({})", entity.members[owner].name);
    }
    if let Some(spec) = &key.spec {
        return format!("{prefix}({spec})");
    }
    format!("{prefix}#{ki}")
}

/// Post-expansion finalize: value-array slots, primary-key column flags,
/// entity flags, incoming references and submit-order depths.
pub(crate) fn finalize(entities: &mut Vec<EntityInfo>) {
    for entity in entities.iter_mut() {
        // Value-array slots, one per column member, in member order.
        let mut next = 0usize;
        for m in &mut entity.members {
            if let MemberKind::Column(c) = &mut m.kind {
                c.value_index = next;
                next += 1;
            }
        }
        entity.column_count = next;

        // Primary-key columns are implicitly non-nullable.
        if let Some(pk) = entity.primary_key {
            if entity.keys[pk].status == KeyStatus::Expanded {
                let cols: Vec<usize> =
                    entity.keys[pk].expanded.iter().map(|em| em.member).collect();
                for mi in cols {
                    if let MemberKind::Column(c) = &mut entity.members[mi].kind {
                        c.primary_key = true;
                        c.nullable = false;
                    }
                }
            }
        }

        let has_identity = entity
            .columns()
            .any(|(_, _, c)| c.auto == AutoValueKind::Identity && !c.foreign_key);
        let references_identity = entity
            .columns()
            .any(|(_, _, c)| c.auto == AutoValueKind::Identity && c.foreign_key);
        let has_row_version = entity.columns().any(|(_, _, c)| c.row_version);
        entity.has_identity = has_identity;
        entity.references_identity = references_identity;
        entity.has_row_version = has_row_version;
    }

    // Incoming references.
    let mut incoming: Vec<Vec<(EntityId, usize)>> = vec![Vec::new(); entities.len()];
    for (ei, entity) in entities.iter().enumerate() {
        for (mi, m) in entity.members.iter().enumerate() {
            if let Some(r) = m.as_reference() {
                incoming[r.target.0].push((EntityId(ei), mi));
            }
        }
    }
    for (entity, refs) in entities.iter_mut().zip(incoming) {
        entity.referenced_by = refs;
    }

    // Foreign-key depth for submit ordering: referenced entities first.
    // Self-references are ignored; depth stabilizes within n passes even if
    // the entity graph itself is cyclic (key expansion already proved the
    // key graph is not).
    let n = entities.len();
    for _ in 0..n {
        let mut stable = true;
        for ei in 0..n {
            let depth = entities[ei]
                .members
                .iter()
                .filter_map(|m| m.as_reference())
                .filter(|r| r.target.0 != ei)
                .map(|r| entities[r.target.0].depth + 1)
                .max()
                .unwrap_or(0)
                .min(n);
            if depth != entities[ei].depth {
                entities[ei].depth = depth;
                stable = false;
            }
        }
        if stable {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SchemaBuilder;
    use crate::graph::Schema;
    use relmodel_core::DataKind;

    fn base_builder() -> SchemaBuilder {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Customer")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Name", DataKind::String, |c| c.size(50));
        builder
    }

    fn order_schema() -> Schema {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference("Customer", "Customer")
            .column("Total", DataKind::Decimal { precision: 12, scale: 2 }, |c| c);
        builder.build().expect("schema builds")
    }

    #[test]
    fn parse_spec_directions_and_whitespace() {
        let parsed = parse_member_spec("A, B:desc , C:ASC,,D:Desc");
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), false),
                ("B".to_string(), true),
                ("C".to_string(), false),
                ("D".to_string(), true),
            ]
        );
    }

    #[test]
    fn fk_synthesizes_mirror_column() {
        let schema = order_schema();
        let order = schema.entity_by_name("Order").unwrap();

        let (mi, member) = order.member("Customer_Id").expect("synthesized column");
        let col = member.as_column().expect("is a column");
        assert_eq!(col.data_kind, DataKind::Int);
        assert!(col.foreign_key);
        assert!(!col.nullable);
        assert_eq!(col.auto, AutoValueKind::Identity);

        let r = order.member("Customer").unwrap().1.as_reference().unwrap();
        let fk = &order.keys[r.from_key];
        assert_eq!(fk.status(), KeyStatus::Expanded);
        assert_eq!(fk.expanded_members().len(), 1);
        assert_eq!(fk.expanded_members()[0].member, mi);
    }

    #[test]
    fn nullable_reference_flips_fk_column_nullable() {
        let mut builder = base_builder();
        builder
            .entity("Note")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference_with("Customer", "Customer", |r| r.nullable());

        let schema = builder.build().expect("schema builds");
        let note = schema.entity_by_name("Note").unwrap();
        let col = note.member("Customer_Id").unwrap().1.as_column().unwrap();
        assert!(col.nullable);
    }

    #[test]
    fn fk_chain_of_depth_three_converges() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference("Customer", "Customer");
        builder
            .entity("OrderLine")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference("Order", "Order");

        let schema = builder.build().expect("chain converges");
        for (_, entity) in schema.entities() {
            for key in &entity.keys {
                assert_eq!(key.status(), KeyStatus::Expanded, "{}", key.name());
            }
        }
        assert_eq!(schema.entity_by_name("Customer").unwrap().depth, 0);
        assert_eq!(schema.entity_by_name("Order").unwrap().depth, 1);
        assert_eq!(schema.entity_by_name("OrderLine").unwrap().depth, 2);
    }

    #[test]
    fn composite_pk_through_references_expands() {
        // A link entity whose primary key is made of its two references.
        let mut builder = base_builder();
        builder
            .entity("Group")
            .column("Id", DataKind::Int, |c| c.identity().primary_key());
        builder
            .entity("CustomerGroup")
            .reference("Customer", "Customer")
            .reference("Group", "Group")
            .primary_key("Customer,Group");

        let schema = builder.build().expect("link entity builds");
        let link = schema.entity_by_name("CustomerGroup").unwrap();
        let pk = link.primary_key().unwrap();
        let cols: Vec<&str> = pk
            .expanded_members()
            .iter()
            .map(|em| link.members[em.member].name.as_str())
            .collect();
        assert_eq!(cols, vec!["Customer_Id", "Group_Id"]);

        // PK columns picked up the implicit flags.
        for em in pk.expanded_members() {
            let col = link.members[em.member].as_column().unwrap();
            assert!(col.primary_key);
            assert!(!col.nullable);
        }
    }

    #[test]
    fn self_reference_is_not_a_cycle() {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Employee")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference_with("Manager", "Employee", |r| r.nullable());

        let schema = builder.build().expect("self-reference builds");
        let employee = schema.entity_by_name("Employee").unwrap();
        let col = employee.member("Manager_Id").unwrap().1.as_column().unwrap();
        assert!(col.nullable);
        assert!(col.foreign_key);
        // Depth ignores the self-loop.
        assert_eq!(employee.depth, 0);
    }

    #[test]
    fn true_circular_reference_names_both_keys() {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("A")
            .reference("B", "B")
            .primary_key("B");
        builder
            .entity("B")
            .reference("A", "A")
            .primary_key("A");

        let err = builder.build().unwrap_err();
        let circular: Vec<&str> = err
            .faults
            .iter()
            .filter(|f| f.kind == SchemaFaultKind::CircularReference)
            .map(|f| f.entity.as_str())
            .collect();
        assert!(circular.contains(&"A"), "faults: {:?}", err.faults);
        assert!(circular.contains(&"B"), "faults: {:?}", err.faults);
    }

    #[test]
    fn explicit_fk_columns_count_mismatch_is_reported() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .reference_with("Customer", "Customer", |r| {
                r.fk_columns(&["CustA", "CustB"])
            });

        let err = builder.build().unwrap_err();
        assert!(err
            .faults
            .iter()
            .any(|f| f.kind == SchemaFaultKind::ColumnCountMismatch));
    }

    #[test]
    fn predeclared_fk_column_must_match_type() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Customer_Id", DataKind::BigInt, |c| c)
            .reference("Customer", "Customer");

        let err = builder.build().unwrap_err();
        let fault = err
            .faults
            .iter()
            .find(|f| f.kind == SchemaFaultKind::ColumnTypeMismatch)
            .expect("type mismatch reported");
        assert_eq!(fault.member.as_deref(), Some("Customer_Id"));
    }

    #[test]
    fn predeclared_fk_column_with_matching_type_is_reused() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Customer_Id", DataKind::Int, |c| c)
            .reference("Customer", "Customer");

        let schema = builder.build().expect("matching declaration is fine");
        let order = schema.entity_by_name("Order").unwrap();
        let columns = order.columns().count();
        // Id, Customer_Id - no second synthesized column.
        assert_eq!(columns, 2);
        assert!(order
            .member("Customer_Id")
            .unwrap()
            .1
            .as_column()
            .unwrap()
            .foreign_key);
    }

    #[test]
    fn include_members_expand_after_keys() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("CreatedOn", DataKind::Timestamp, |c| c)
            .reference("Customer", "Customer")
            .index_with("CreatedOn:desc", |ix| ix.include("Customer,Total"))
            .column("Total", DataKind::Decimal { precision: 12, scale: 2 }, |c| c);

        let schema = builder.build().expect("schema builds");
        let order = schema.entity_by_name("Order").unwrap();
        let index = order
            .keys
            .iter()
            .find(|k| k.key_type == KeyType::Index)
            .unwrap();
        let names: Vec<&str> = index
            .include_members()
            .iter()
            .map(|mi| order.members[*mi].name.as_str())
            .collect();
        assert_eq!(names, vec!["Customer_Id", "Total"]);
    }

    #[test]
    fn synthesized_key_names() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .column("Number", DataKind::String, |c| c.size(20).unique())
            .reference("Customer", "Customer")
            .index("Number,Id:desc");

        let schema = builder.build().expect("schema builds");
        let order = schema.entity_by_name("Order").unwrap();

        assert!(order.key("PK_Order").is_some());
        assert!(order.key("FK_Order_Customer").is_some());
        assert!(order.key("IX_Order_Number_Id").is_some());
        assert!(order.key("IXU_Order_Number").is_some());
    }

    #[test]
    fn unknown_key_member_is_reported_by_name() {
        let mut builder = base_builder();
        builder
            .entity("Order")
            .column("Id", DataKind::Int, |c| c.identity().primary_key())
            .index("NoSuchMember");

        let err = builder.build().unwrap_err();
        let fault = err
            .faults
            .iter()
            .find(|f| f.kind == SchemaFaultKind::UnknownMember)
            .expect("unknown member reported");
        assert!(fault.message.contains("NoSuchMember"));
    }

    #[test]
    fn value_indices_cover_all_columns() {
        let schema = order_schema();
        let order = schema.entity_by_name("Order").unwrap();
        // Id, Total, Customer_Id (synthesized last).
        assert_eq!(order.column_count, 3);
        let mut indices: Vec<usize> =
            order.columns().map(|(_, _, c)| c.value_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn incoming_references_recorded() {
        let schema = order_schema();
        let customer = schema.entity_by_name("Customer").unwrap();
        assert_eq!(customer.referenced_by.len(), 1);
        let (re, rm) = customer.referenced_by[0];
        assert_eq!(schema.entity(re).name, "Order");
        assert_eq!(schema.entity(re).members[rm].name, "Customer");
    }
}
