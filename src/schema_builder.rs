use futures::future::BoxFuture;
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Document, Type, TypeDefinition, Value as AstValue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::build_full_action_name;
use crate::context::GraphQLContext;
use crate::error::SchemaError;
use crate::GraphQLError;

/// Stitching directive declarations prepended to every fragment's SDL. The
/// advertised type-def text carries them so the gateway can parse merge
/// configuration straight out of the fragment.
pub const STITCHING_DIRECTIVE_TYPE_DEFS: &str = "\
directive @merge(keyField: String, keyArg: String, key: [String!], argsExpr: String, additionalArgs: String) on FIELD_DEFINITION
directive @key(selectionSet: String!) on OBJECT
directive @computed(selectionSet: String!) on FIELD_DEFINITION
directive @canonical on OBJECT | INTERFACE | INPUT_OBJECT | UNION | ENUM | SCALAR | FIELD_DEFINITION | INPUT_FIELD_DEFINITION
";

const MERGE_DIRECTIVE_ARGS: &[&str] = &["keyField", "keyArg", "key", "argsExpr", "additionalArgs"];

/// A hand-written resolver function: `(parent, arguments, context) -> value`.
pub type ResolverFn = Arc<
    dyn Fn(Value, Map<String, Value>, GraphQLContext) -> BoxFuture<'static, Result<Value, GraphQLError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub enum Resolver {
    /// Calls the named broker action with the coerced field arguments.
    Action(String),
    Function(ResolverFn),
}

/// Pure schema rewrite applied after construction. Transformers run as a
/// pipeline in the order supplied; each sees the output of the previous one.
pub type SchemaTransformer = Arc<dyn Fn(BuiltSchema) -> BuiltSchema + Send + Sync>;

/// One GraphQL-exposed action: the action name plus the root field names it
/// resolves. A single action may fan out to several field names.
#[derive(Clone, Debug, Default)]
pub struct ActionBinding {
    pub action: String,
    pub query: Vec<String>,
    pub mutation: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ArgumentDef {
    pub name: String,
    pub is_list: bool,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    /// Innermost named type of the field, list/non-null wrappers stripped.
    pub type_name: String,
    pub arguments: Vec<ArgumentDef>,
}

/// An executable schema fragment: the parsed document, a structural type
/// index, the resolver table, and the exact advertised type-def text.
pub struct BuiltSchema {
    pub document: Document<'static, String>,
    pub type_defs: String,
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub types: HashMap<String, HashMap<String, FieldDef>>,
    pub resolvers: HashMap<String, HashMap<String, Resolver>>,
}

impl BuiltSchema {
    /// Parse type definitions into a resolver-less schema shell. This is what
    /// the gateway rebuilds from advertised SDL: structure only, no
    /// executable behavior.
    pub fn shell(type_defs: &str) -> Result<Self, SchemaError> {
        let document = parse_schema::<String>(type_defs)
            .map_err(|err| SchemaError::InvalidTypeDefs(err.to_string()))?
            .into_static();

        let mut types: HashMap<String, HashMap<String, FieldDef>> = HashMap::new();
        let mut query_type = None;
        let mut mutation_type = None;

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema_def) => {
                    query_type = schema_def.query.clone();
                    mutation_type = schema_def.mutation.clone();
                }
                Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                    let fields = object
                        .fields
                        .iter()
                        .map(|field| {
                            let def = FieldDef {
                                type_name: named_type(&field.field_type).to_string(),
                                arguments: field
                                    .arguments
                                    .iter()
                                    .map(|arg| ArgumentDef {
                                        name: arg.name.clone(),
                                        is_list: type_is_list(&arg.value_type),
                                    })
                                    .collect(),
                            };
                            (field.name.clone(), def)
                        })
                        .collect();
                    types.insert(object.name.clone(), fields);
                }
                _ => {}
            }
        }

        if query_type.is_none() && types.contains_key("Query") {
            query_type = Some("Query".to_string());
        }
        if mutation_type.is_none() && types.contains_key("Mutation") {
            mutation_type = Some("Mutation".to_string());
        }

        Ok(BuiltSchema {
            document,
            type_defs: type_defs.to_string(),
            query_type,
            mutation_type,
            types,
            resolvers: HashMap::new(),
        })
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.get(field_name)
    }

    pub fn resolver(&self, type_name: &str, field_name: &str) -> Option<&Resolver> {
        self.resolvers.get(type_name)?.get(field_name)
    }

    fn is_root_type(&self, type_name: &str) -> bool {
        self.query_type.as_deref() == Some(type_name)
            || self.mutation_type.as_deref() == Some(type_name)
    }
}

impl std::fmt::Debug for BuiltSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltSchema")
            .field("query_type", &self.query_type)
            .field("mutation_type", &self.mutation_type)
            .field("types", &self.types.keys())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SchemaBuilderOptions {
    pub bindings: Vec<ActionBinding>,
    pub resolvers: HashMap<String, HashMap<String, Resolver>>,
    pub schema_directive_transformers: Vec<SchemaTransformer>,
}

/// Turns one service's type definitions and field/action bindings into an
/// executable fragment plus the advertised type-def text.
pub struct SchemaBuilder {
    service_name: String,
    version: Option<u32>,
    type_defs: String,
    options: SchemaBuilderOptions,
}

impl SchemaBuilder {
    pub fn new(
        service_name: &str,
        version: Option<u32>,
        type_defs: &str,
        options: SchemaBuilderOptions,
    ) -> Self {
        SchemaBuilder {
            service_name: service_name.to_string(),
            version,
            type_defs: format!("{STITCHING_DIRECTIVE_TYPE_DEFS}\n{type_defs}"),
            options,
        }
    }

    /// The exact type-def text advertised to the gateway: injected directive
    /// declarations followed by the supplied SDL.
    pub fn type_defs(&self) -> &str {
        &self.type_defs
    }

    pub fn build(self) -> Result<BuiltSchema, SchemaError> {
        let mut schema = BuiltSchema::shell(&self.type_defs)?;

        validate_stitching_directives(&schema.document)?;

        for binding in &self.options.bindings {
            let full_action_name =
                build_full_action_name(&self.service_name, &binding.action, self.version);

            bind_root_fields(
                &mut schema,
                RootKind::Query,
                &binding.query,
                &full_action_name,
            )?;
            bind_root_fields(
                &mut schema,
                RootKind::Mutation,
                &binding.mutation,
                &full_action_name,
            )?;
        }

        merge_resolvers(&mut schema, self.options.resolvers)?;

        let schema = self
            .options
            .schema_directive_transformers
            .iter()
            .fold(schema, |acc, transformer| transformer(acc));

        Ok(schema)
    }
}

enum RootKind {
    Query,
    Mutation,
}

fn bind_root_fields(
    schema: &mut BuiltSchema,
    kind: RootKind,
    field_names: &[String],
    full_action_name: &str,
) -> Result<(), SchemaError> {
    if field_names.is_empty() {
        return Ok(());
    }

    let (root, fallback) = match kind {
        RootKind::Query => (schema.query_type.clone(), "Query"),
        RootKind::Mutation => (schema.mutation_type.clone(), "Mutation"),
    };
    let Some(root) = root else {
        return Err(SchemaError::UnknownField {
            type_name: fallback.to_string(),
            field: field_names[0].clone(),
        });
    };

    for field_name in field_names {
        if schema.field(&root, field_name).is_none() {
            return Err(SchemaError::UnknownField {
                type_name: root.clone(),
                field: field_name.clone(),
            });
        }

        let entry = schema.resolvers.entry(root.clone()).or_default();
        if entry.contains_key(field_name) {
            return Err(SchemaError::DuplicateRootField {
                type_name: root.clone(),
                field: field_name.clone(),
            });
        }
        entry.insert(
            field_name.clone(),
            Resolver::Action(full_action_name.to_string()),
        );
    }

    Ok(())
}

/// Hand-supplied resolvers never override root fields already taken by action
/// bindings; nested-type resolvers are last-write.
fn merge_resolvers(
    schema: &mut BuiltSchema,
    resolvers: HashMap<String, HashMap<String, Resolver>>,
) -> Result<(), SchemaError> {
    for (type_name, fields) in resolvers {
        if !schema.has_type(&type_name) {
            return Err(SchemaError::UnknownType(type_name));
        }
        let is_root = schema.is_root_type(&type_name);

        for (field_name, resolver) in fields {
            if schema.field(&type_name, &field_name).is_none() {
                return Err(SchemaError::UnknownField {
                    type_name: type_name.clone(),
                    field: field_name.clone(),
                });
            }

            let entry = schema.resolvers.entry(type_name.clone()).or_default();
            if is_root && entry.contains_key(&field_name) {
                continue;
            }
            entry.insert(field_name, resolver);
        }
    }

    Ok(())
}

fn validate_stitching_directives(document: &Document<'static, String>) -> Result<(), SchemaError> {
    for definition in &document.definitions {
        let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition else {
            continue;
        };

        for directive in &object.directives {
            match directive.name.as_str() {
                "key" => require_selection_set_arg("key", &directive.arguments)?,
                "canonical" => {}
                "merge" | "computed" => {
                    return Err(SchemaError::InvalidDirective {
                        directive: directive.name.clone(),
                        reason: format!(
                            "only allowed on field definitions, found on type `{}`",
                            object.name
                        ),
                    });
                }
                _ => {}
            }
        }

        for field in &object.fields {
            for directive in &field.directives {
                match directive.name.as_str() {
                    "merge" => validate_merge_args(&directive.arguments)?,
                    "computed" => require_selection_set_arg("computed", &directive.arguments)?,
                    "key" => {
                        return Err(SchemaError::InvalidDirective {
                            directive: "key".to_string(),
                            reason: format!(
                                "only allowed on object types, found on field `{}.{}`",
                                object.name, field.name
                            ),
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

fn require_selection_set_arg(
    directive: &str,
    arguments: &[(String, AstValue<'static, String>)],
) -> Result<(), SchemaError> {
    match arguments.iter().find(|(name, _)| name == "selectionSet") {
        Some((_, AstValue::String(_))) => Ok(()),
        _ => Err(SchemaError::InvalidDirective {
            directive: directive.to_string(),
            reason: "requires a string `selectionSet` argument".to_string(),
        }),
    }
}

fn validate_merge_args(
    arguments: &[(String, AstValue<'static, String>)],
) -> Result<(), SchemaError> {
    for (name, value) in arguments {
        if !MERGE_DIRECTIVE_ARGS.contains(&name.as_str()) {
            return Err(SchemaError::InvalidDirective {
                directive: "merge".to_string(),
                reason: format!("unknown argument `{name}`"),
            });
        }

        let well_formed = match name.as_str() {
            "key" => matches!(value, AstValue::List(_)),
            _ => matches!(value, AstValue::String(_)),
        };
        if !well_formed {
            return Err(SchemaError::InvalidDirective {
                directive: "merge".to_string(),
                reason: format!("argument `{name}` has the wrong kind of value"),
            });
        }
    }

    Ok(())
}

pub(crate) fn named_type<'a>(field_type: &'a Type<'static, String>) -> &'a str {
    match field_type {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

pub(crate) fn type_is_list(field_type: &Type<'static, String>) -> bool {
    match field_type {
        Type::NamedType(_) => false,
        Type::ListType(_) => true,
        Type::NonNullType(inner) => type_is_list(inner),
    }
}
