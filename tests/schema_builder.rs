use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use stitchgate::error::SchemaError;
use stitchgate::schema_builder::{
    ActionBinding, Resolver, SchemaBuilder, SchemaBuilderOptions, SchemaTransformer,
    STITCHING_DIRECTIVE_TYPE_DEFS,
};

const TYPE_DEFS: &str = "\
type Query {
  author: Author!
}

type Author {
  id: ID!
  name: String!
}
";

fn noop_resolver() -> Resolver {
    Resolver::Function(Arc::new(|_parent, _args, _ctx| {
        Box::pin(async move { Ok(json!(null)) })
    }))
}

#[test]
fn advertised_type_defs_carry_the_injected_directives() {
    let builder = SchemaBuilder::new("test", None, TYPE_DEFS, SchemaBuilderOptions::default());

    assert!(builder.type_defs().starts_with(STITCHING_DIRECTIVE_TYPE_DEFS));
    assert!(builder.type_defs().contains("type Author"));
}

#[test]
fn binds_root_query_resolvers_from_actions() {
    let options = SchemaBuilderOptions {
        bindings: vec![ActionBinding {
            action: "author".to_string(),
            query: vec!["author".to_string()],
            mutation: Vec::new(),
        }],
        ..Default::default()
    };

    let schema = SchemaBuilder::new("test", Some(2), TYPE_DEFS, options)
        .build()
        .expect("schema builds");

    assert!(matches!(
        schema.resolver("Query", "author"),
        Some(Resolver::Action(action)) if action == "v2.test.author"
    ));
}

#[test]
fn duplicate_root_bindings_fail_the_build() {
    let options = SchemaBuilderOptions {
        bindings: vec![
            ActionBinding {
                action: "one".to_string(),
                query: vec!["author".to_string()],
                mutation: Vec::new(),
            },
            ActionBinding {
                action: "two".to_string(),
                query: vec!["author".to_string()],
                mutation: Vec::new(),
            },
        ],
        ..Default::default()
    };

    let err = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect_err("duplicate binding must fail");

    assert!(matches!(
        err,
        SchemaError::DuplicateRootField { type_name, field }
            if type_name == "Query" && field == "author"
    ));
}

#[test]
fn bindings_to_undeclared_fields_fail_the_build() {
    let options = SchemaBuilderOptions {
        bindings: vec![ActionBinding {
            action: "missing".to_string(),
            query: vec!["nope".to_string()],
            mutation: Vec::new(),
        }],
        ..Default::default()
    };

    let err = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect_err("unknown field must fail");

    assert!(matches!(err, SchemaError::UnknownField { field, .. } if field == "nope"));
}

#[test]
fn malformed_type_defs_fail_the_build() {
    let err = SchemaBuilder::new(
        "test",
        None,
        "type Query {",
        SchemaBuilderOptions::default(),
    )
    .build()
    .expect_err("malformed SDL must fail");

    assert!(matches!(err, SchemaError::InvalidTypeDefs(_)));
}

#[test]
fn key_directive_requires_a_selection_set() {
    let err = SchemaBuilder::new(
        "test",
        None,
        "type Query {\n  author: Author\n}\n\ntype Author @key {\n  id: ID!\n}\n",
        SchemaBuilderOptions::default(),
    )
    .build()
    .expect_err("@key without selectionSet must fail");

    assert!(matches!(err, SchemaError::InvalidDirective { directive, .. } if directive == "key"));
}

#[test]
fn merge_directive_is_rejected_on_object_types() {
    let err = SchemaBuilder::new(
        "test",
        None,
        "type Query {\n  author: Author\n}\n\ntype Author @merge(keyField: \"id\") {\n  id: ID!\n}\n",
        SchemaBuilderOptions::default(),
    )
    .build()
    .expect_err("@merge on a type must fail");

    assert!(matches!(err, SchemaError::InvalidDirective { directive, .. } if directive == "merge"));
}

#[test]
fn merge_directive_rejects_unknown_arguments() {
    let err = SchemaBuilder::new(
        "test",
        None,
        "type Query {\n  author(id: ID!): Author @merge(wrong: \"id\")\n}\n\ntype Author {\n  id: ID!\n}\n",
        SchemaBuilderOptions::default(),
    )
    .build()
    .expect_err("unknown @merge argument must fail");

    assert!(
        matches!(err, SchemaError::InvalidDirective { directive, reason } if directive == "merge" && reason.contains("wrong"))
    );
}

#[test]
fn resolvers_for_unknown_types_fail_the_build() {
    let mut options = SchemaBuilderOptions::default();
    options.resolvers.insert(
        "Phantom".to_string(),
        [("field".to_string(), noop_resolver())].into_iter().collect(),
    );

    let err = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect_err("unknown type must fail");

    assert!(matches!(err, SchemaError::UnknownType(name) if name == "Phantom"));
}

#[test]
fn hand_resolvers_never_override_action_bindings_on_root_fields() {
    let mut options = SchemaBuilderOptions {
        bindings: vec![ActionBinding {
            action: "authorAction".to_string(),
            query: vec!["author".to_string()],
            mutation: Vec::new(),
        }],
        ..Default::default()
    };
    options.resolvers.insert(
        "Query".to_string(),
        [("author".to_string(), noop_resolver())].into_iter().collect(),
    );

    let schema = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect("schema builds");

    assert!(matches!(
        schema.resolver("Query", "author"),
        Some(Resolver::Action(action)) if action == "test.authorAction"
    ));
}

#[test]
fn nested_resolvers_are_last_write() {
    let mut options = SchemaBuilderOptions::default();
    options.resolvers.insert(
        "Author".to_string(),
        [("name".to_string(), noop_resolver())].into_iter().collect(),
    );

    let schema = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect("schema builds");

    assert!(matches!(
        schema.resolver("Author", "name"),
        Some(Resolver::Function(_))
    ));
}

#[test]
fn directive_transformers_run_as_a_pipeline_in_order() {
    let first: SchemaTransformer = Arc::new(|mut schema| {
        schema.type_defs.push_str("# first\n");
        schema
    });
    let second: SchemaTransformer = Arc::new(|mut schema| {
        schema.type_defs.push_str("# second\n");
        schema
    });

    let options = SchemaBuilderOptions {
        schema_directive_transformers: vec![first, second],
        ..Default::default()
    };

    let schema = SchemaBuilder::new("test", None, TYPE_DEFS, options)
        .build()
        .expect("schema builds");

    assert!(schema.type_defs.ends_with("# first\n# second\n"));
}

#[test]
fn full_action_names_include_the_version_when_present() {
    assert_eq!(
        stitchgate::build_full_action_name("testService", "testAction", None),
        "testService.testAction"
    );
    assert_eq!(
        stitchgate::build_full_action_name("testService", "testAction", Some(2)),
        "v2.testService.testAction"
    );
}
