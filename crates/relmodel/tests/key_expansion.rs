//! Schema-level behavior of the key expander, end to end through the
//! public builder API.

use relmodel::{
    DataKind, KeyStatus, SchemaBuilder, SchemaFaultKind,
};

fn customer_order_builder() -> SchemaBuilder {
    let mut builder = SchemaBuilder::new();
    builder
        .entity("Customer")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .column("Email", DataKind::String, |c| c.size(100).unique());
    builder
        .entity("Order")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .reference("Customer", "Customer")
        .column("Total", DataKind::Decimal { precision: 12, scale: 2 }, |c| c.nullable());
    builder
}

#[test]
fn customer_reference_synthesizes_customer_id() {
    let schema = customer_order_builder().build().expect("schema builds");
    let order = schema.entity_by_name("Order").unwrap();

    let (_, member) = order.member("Customer_Id").expect("synthesized column");
    let col = member.as_column().expect("column");
    assert_eq!(col.data_kind, DataKind::Int);
    assert!(!col.nullable);
    assert!(col.foreign_key);
}

#[test]
fn nullable_reference_synthesizes_nullable_column() {
    let mut builder = customer_order_builder();
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
fn synthesized_column_count_matches_target_key() {
    // Reference a composite unique key rather than the primary key.
    let mut builder = SchemaBuilder::new();
    builder
        .entity("Warehouse")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .column("Region", DataKind::String, |c| c.size(10))
        .column("Code", DataKind::String, |c| c.size(10))
        .index_with("Region,Code", |ix| ix.unique().name("IXU_Warehouse_Location"));
    builder
        .entity("Shipment")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .reference_with("Warehouse", "Warehouse", |r| {
            r.nullable().to_key("IXU_Warehouse_Location")
        });

    let schema = builder.build().expect("schema builds");
    let warehouse = schema.entity_by_name("Warehouse").unwrap();
    let target_key = warehouse.key("IXU_Warehouse_Location").unwrap();

    let shipment = schema.entity_by_name("Shipment").unwrap();
    let r = shipment
        .member("Warehouse")
        .unwrap()
        .1
        .as_reference()
        .unwrap();
    let fk = &shipment.keys[r.from_key];

    assert_eq!(
        fk.expanded_members().len(),
        target_key.expanded_members().len()
    );
    for em in fk.expanded_members() {
        let col = shipment.members[em.member].as_column().unwrap();
        assert!(col.nullable, "nullability follows the reference member");
        assert_eq!(col.size, Some(10), "size copied from the target column");
    }
    assert!(shipment.member("Warehouse_Region").is_some());
    assert!(shipment.member("Warehouse_Code").is_some());
}

#[test]
fn dependency_chain_expands_within_bound() {
    let mut builder = customer_order_builder();
    builder
        .entity("OrderLine")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .reference("Order", "Order")
        .column("Qty", DataKind::Int, |c| c);
    builder
        .entity("LineNote")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .reference("OrderLine", "OrderLine");

    let schema = builder.build().expect("four-deep chain converges");
    for (_, entity) in schema.entities() {
        for key in &entity.keys {
            assert_eq!(
                key.status(),
                KeyStatus::Expanded,
                "{} / {}",
                entity.name,
                key.name()
            );
        }
    }
}

#[test]
fn circular_required_references_fail_naming_both_sides() {
    let mut builder = SchemaBuilder::new();
    builder.entity("A").reference("B", "B").primary_key("B");
    builder.entity("B").reference("A", "A").primary_key("A");

    let err = builder.build().unwrap_err();
    let entities: Vec<&str> = err
        .faults
        .iter()
        .filter(|f| f.kind == SchemaFaultKind::CircularReference)
        .map(|f| f.entity.as_str())
        .collect();
    assert!(entities.contains(&"A"));
    assert!(entities.contains(&"B"));
}

#[test]
fn all_build_problems_reported_together() {
    let mut builder = SchemaBuilder::new();
    builder
        .entity("Customer")
        .column("Id", DataKind::Int, |c| c.identity().primary_key())
        .index("NoSuchMember");
    builder
        .entity("Orphan")
        .column("Name", DataKind::String, |c| c);

    let err = builder.build().unwrap_err();
    assert!(err.faults.len() >= 2, "faults: {:?}", err.faults);
    assert!(err
        .faults
        .iter()
        .any(|f| f.kind == SchemaFaultKind::UnknownMember));
    assert!(err
        .faults
        .iter()
        .any(|f| f.entity == "Orphan" && f.message.contains("no primary key")));
}
