use futures::future::BoxFuture;
use graphql_parser::parse_query;
use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, Number, OperationDefinition,
    Selection, SelectionSet, TypeCondition, Value as AstValue, VariableDefinition,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::GraphQLContext;
use crate::schema_builder::{BuiltSchema, Resolver};
use crate::validation::Validator;
use crate::{ExecutionResult, GraphQLError, PathSegment};

pub(crate) type Fragments<'a> = HashMap<&'a str, &'a FragmentDefinition<'static, String>>;

/// Executes one query against one schema with one context. Validation runs
/// only when a validator is attached; execution never proceeds on a query
/// with validation errors.
pub struct GraphQLExecutor {
    schema: Arc<BuiltSchema>,
    validator: Option<Validator>,
}

impl GraphQLExecutor {
    pub fn new(schema: Arc<BuiltSchema>) -> Self {
        GraphQLExecutor {
            schema,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn schema(&self) -> &Arc<BuiltSchema> {
        &self.schema
    }

    pub async fn execute(
        &self,
        ctx: GraphQLContext,
        query: &str,
        variables: Option<&Map<String, Value>>,
        operation_name: Option<&str>,
    ) -> ExecutionResult {
        let document = match parse_query::<String>(query) {
            Ok(document) => document.into_static(),
            Err(err) => {
                return ExecutionResult::of_error(GraphQLError::new(format!(
                    "Failed to parse query: {err}"
                )));
            }
        };

        if let Some(validator) = &self.validator {
            let errors = validator.validate(&document);
            if !errors.is_empty() {
                return ExecutionResult::of_errors(errors);
            }
        }

        self.execute_document(ctx, &document, variables, operation_name)
            .await
    }

    pub async fn execute_document(
        &self,
        ctx: GraphQLContext,
        document: &Document<'static, String>,
        variables: Option<&Map<String, Value>>,
        operation_name: Option<&str>,
    ) -> ExecutionResult {
        let fragments = collect_fragments(document);

        let operation = match select_operation(document, operation_name) {
            Ok(operation) => operation,
            Err(err) => return ExecutionResult::of_error(err),
        };

        let root_type = match operation.kind {
            OperationKind::Query => self.schema.query_type.clone(),
            OperationKind::Mutation => self.schema.mutation_type.clone(),
            OperationKind::Subscription => {
                return ExecutionResult::of_error(GraphQLError::new(
                    "Subscriptions are not supported.",
                ));
            }
        };
        let Some(root_type) = root_type else {
            return ExecutionResult::of_error(GraphQLError::new(format!(
                "Schema is not configured to execute {} operations.",
                operation.kind
            )));
        };

        let variables = coerce_variable_values(operation.variable_definitions, variables);

        let execution = Execution {
            schema: &self.schema,
            ctx: &ctx,
            variables: &variables,
            fragments: &fragments,
        };

        let mut errors = Vec::new();
        let data = execution
            .selection_set(
                &root_type,
                operation.selection_set,
                &Value::Null,
                &[],
                &mut errors,
            )
            .await;

        ExecutionResult {
            data: Some(data),
            errors,
        }
    }
}

struct Execution<'a> {
    schema: &'a BuiltSchema,
    ctx: &'a GraphQLContext,
    variables: &'a Map<String, Value>,
    fragments: &'a Fragments<'a>,
}

impl<'a> Execution<'a> {
    fn selection_set<'b>(
        &'b self,
        type_name: &'b str,
        selection_set: &'b SelectionSet<'static, String>,
        parent: &'b Value,
        path: &'b [PathSegment],
        errors: &'b mut Vec<GraphQLError>,
    ) -> BoxFuture<'b, Value> {
        Box::pin(async move {
            let mut fields = Vec::new();
            let mut active_fragments = Vec::new();
            self.collect_fields(
                type_name,
                &selection_set.items,
                &mut active_fragments,
                &mut fields,
            );

            let mut data = Map::new();
            for field in fields {
                let response_key = field.alias.as_ref().unwrap_or(&field.name).clone();

                if field.name == "__typename" {
                    data.insert(response_key, Value::String(type_name.to_string()));
                    continue;
                }

                let mut field_path = path.to_vec();
                field_path.push(PathSegment::Field(response_key.clone()));

                let arguments = coerce_argument_values(&field.arguments, self.variables);
                let value = match self.resolve_field(type_name, field, parent, arguments).await {
                    Ok(value) => {
                        let field_type = self
                            .schema
                            .field(type_name, &field.name)
                            .map(|def| def.type_name.clone())
                            .unwrap_or_default();
                        self.complete_value(
                            &field_type,
                            &field.selection_set,
                            value,
                            &field_path,
                            errors,
                        )
                        .await
                    }
                    Err(mut err) => {
                        if err.locations.is_empty() {
                            err = err.at(field.position);
                        }
                        if err.path.is_empty() {
                            err = err.with_path(field_path);
                        }
                        errors.push(err);
                        Value::Null
                    }
                };
                data.insert(response_key, value);
            }

            Value::Object(data)
        })
    }

    async fn resolve_field(
        &self,
        type_name: &str,
        field: &Field<'static, String>,
        parent: &Value,
        arguments: Map<String, Value>,
    ) -> Result<Value, GraphQLError> {
        match self.schema.resolver(type_name, &field.name) {
            Some(Resolver::Action(action)) => self
                .ctx
                .call(action, Value::Object(arguments))
                .await
                .map_err(|err| GraphQLError::new(err.to_string())),
            Some(Resolver::Function(function)) => {
                function(parent.clone(), arguments, self.ctx.clone()).await
            }
            None => Ok(parent.get(&field.name).cloned().unwrap_or(Value::Null)),
        }
    }

    fn complete_value<'b>(
        &'b self,
        type_name: &'b str,
        selection_set: &'b SelectionSet<'static, String>,
        value: Value,
        path: &'b [PathSegment],
        errors: &'b mut Vec<GraphQLError>,
    ) -> BoxFuture<'b, Value> {
        Box::pin(async move {
            if selection_set.items.is_empty() {
                return value;
            }

            match value {
                Value::Null => Value::Null,
                Value::Array(items) => {
                    let mut completed = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        let mut item_path = path.to_vec();
                        item_path.push(PathSegment::Index(index));
                        completed.push(
                            self.complete_value(type_name, selection_set, item, &item_path, errors)
                                .await,
                        );
                    }
                    Value::Array(completed)
                }
                object @ Value::Object(_) => {
                    self.selection_set(type_name, selection_set, &object, path, errors)
                        .await
                }
                scalar => scalar,
            }
        })
    }

    fn collect_fields<'b>(
        &'b self,
        type_name: &str,
        items: &'b [Selection<'static, String>],
        active_fragments: &mut Vec<&'b str>,
        out: &mut Vec<&'b Field<'static, String>>,
    ) {
        for selection in items {
            match selection {
                Selection::Field(field) => {
                    if should_include(&field.directives, self.variables) {
                        out.push(field);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !should_include(&spread.directives, self.variables) {
                        continue;
                    }
                    if active_fragments.contains(&spread.fragment_name.as_str()) {
                        continue;
                    }
                    if let Some(fragment) = self.fragments.get(spread.fragment_name.as_str()) {
                        let TypeCondition::On(condition) = &fragment.type_condition;
                        if self.type_condition_matches(type_name, condition) {
                            active_fragments.push(&spread.fragment_name);
                            self.collect_fields(
                                type_name,
                                &fragment.selection_set.items,
                                active_fragments,
                                out,
                            );
                            active_fragments.pop();
                        }
                    }
                }
                Selection::InlineFragment(inline) => {
                    if !should_include(&inline.directives, self.variables) {
                        continue;
                    }
                    let matches = match &inline.type_condition {
                        Some(TypeCondition::On(condition)) => {
                            self.type_condition_matches(type_name, condition)
                        }
                        None => true,
                    };
                    if matches {
                        self.collect_fields(
                            type_name,
                            &inline.selection_set.items,
                            active_fragments,
                            out,
                        );
                    }
                }
            }
        }
    }

    /// Abstract conditions (interfaces, unions) are not tracked in the type
    /// index; anything that is not a known object type is assumed to match.
    fn type_condition_matches(&self, type_name: &str, condition: &str) -> bool {
        condition == type_name || !self.schema.has_type(condition)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

pub(crate) struct OperationRef<'a> {
    pub kind: OperationKind,
    pub variable_definitions: &'a [VariableDefinition<'static, String>],
    pub selection_set: &'a SelectionSet<'static, String>,
}

pub(crate) fn collect_fragments<'a>(document: &'a Document<'static, String>) -> Fragments<'a> {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
            _ => None,
        })
        .collect()
}

/// Standard GraphQL operation selection: honor the requested name, fail on
/// ambiguity.
pub(crate) fn select_operation<'a>(
    document: &'a Document<'static, String>,
    operation_name: Option<&str>,
) -> Result<OperationRef<'a>, GraphQLError> {
    let operations: Vec<&OperationDefinition<'static, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(operation) => Some(operation),
            _ => None,
        })
        .collect();

    let operation = match operation_name {
        Some(name) => operations
            .into_iter()
            .find(|operation| defined_name(operation) == Some(name))
            .ok_or_else(|| GraphQLError::new(format!("Unknown operation named \"{name}\".")))?,
        None => match operations.len() {
            0 => return Err(GraphQLError::new("Must provide an operation.")),
            1 => operations[0],
            _ => {
                return Err(GraphQLError::new(
                    "Must provide operation name if query contains multiple operations.",
                ));
            }
        },
    };

    Ok(match operation {
        OperationDefinition::SelectionSet(selection_set) => OperationRef {
            kind: OperationKind::Query,
            variable_definitions: &[],
            selection_set,
        },
        OperationDefinition::Query(query) => OperationRef {
            kind: OperationKind::Query,
            variable_definitions: &query.variable_definitions,
            selection_set: &query.selection_set,
        },
        OperationDefinition::Mutation(mutation) => OperationRef {
            kind: OperationKind::Mutation,
            variable_definitions: &mutation.variable_definitions,
            selection_set: &mutation.selection_set,
        },
        OperationDefinition::Subscription(subscription) => OperationRef {
            kind: OperationKind::Subscription,
            variable_definitions: &subscription.variable_definitions,
            selection_set: &subscription.selection_set,
        },
    })
}

fn defined_name<'a>(operation: &'a OperationDefinition<'static, String>) -> Option<&'a str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

/// Declared variables only; defaults from the definition fill the gaps.
pub(crate) fn coerce_variable_values(
    definitions: &[VariableDefinition<'static, String>],
    provided: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut variables = Map::new();
    for definition in definitions {
        if let Some(value) = provided.and_then(|map| map.get(&definition.name)) {
            variables.insert(definition.name.clone(), value.clone());
        } else if let Some(default) = &definition.default_value {
            variables.insert(definition.name.clone(), ast_value_to_json(default, &Map::new()));
        }
    }
    variables
}

pub(crate) fn coerce_argument_values(
    arguments: &[(String, AstValue<'static, String>)],
    variables: &Map<String, Value>,
) -> Map<String, Value> {
    arguments
        .iter()
        .map(|(name, value)| (name.clone(), ast_value_to_json(value, variables)))
        .collect()
}

pub(crate) fn should_include(
    directives: &[Directive<'static, String>],
    variables: &Map<String, Value>,
) -> bool {
    for directive in directives {
        let condition = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .map(|(_, value)| ast_value_to_json(value, variables) == Value::Bool(true))
            .unwrap_or(false);

        match directive.name.as_str() {
            "skip" if condition => return false,
            "include" if !condition => return false,
            _ => {}
        }
    }
    true
}

pub(crate) fn ast_value_to_json(
    value: &AstValue<'static, String>,
    variables: &Map<String, Value>,
) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        AstValue::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        AstValue::Float(float) => serde_json::Number::from_f64(*float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AstValue::String(string) => Value::String(string.clone()),
        AstValue::Boolean(boolean) => Value::Bool(*boolean),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => Value::String(name.clone()),
        AstValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| ast_value_to_json(item, variables))
                .collect(),
        ),
        AstValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), ast_value_to_json(value, variables)))
                .collect(),
        ),
    }
}

/// Inverse of [`ast_value_to_json`], used to inline merge-key values as
/// literals in delegated operations.
pub(crate) fn json_to_ast_value(value: &Value) -> AstValue<'static, String> {
    match value {
        Value::Null => AstValue::Null,
        Value::Bool(boolean) => AstValue::Boolean(*boolean),
        Value::Number(number) => match number.as_i64().and_then(|n| i32::try_from(n).ok()) {
            Some(int) => AstValue::Int(Number::from(int)),
            None => AstValue::Float(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(string) => AstValue::String(string.clone()),
        Value::Array(items) => AstValue::List(items.iter().map(json_to_ast_value).collect()),
        Value::Object(map) => AstValue::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_ast_value(value)))
                .collect(),
        ),
    }
}
