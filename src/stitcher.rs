use futures::future::{BoxFuture, join_all};
use graphql_parser::Pos;
use graphql_parser::parse_query;
use graphql_parser::query::{
    Definition as QueryDefinition, Document as QueryDocument, Field, Mutation,
    OperationDefinition, Query, Selection, SelectionSet, TypeCondition, Value as AstValue,
    VariableDefinition,
};
use graphql_parser::schema::{Definition, Document as SchemaDocument, TypeDefinition};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::broker::{GRAPHQL_ACTION_NAME, ServiceBroker, build_full_action_name};
use crate::context::GraphQLContext;
use crate::error::SchemaError;
use crate::executor::{
    Fragments, OperationKind, coerce_variable_values, collect_fragments, json_to_ast_value,
    select_operation, should_include,
};
use crate::schema_builder::{BuiltSchema, named_type, type_is_list};
use crate::{ExecutionResult, GraphQLError, GraphQLRequest, PathSegment};

/// A delegated operation on its way to an owning service. Parsed documents
/// are printed back to text with the canonical printer at the boundary.
pub enum OperationPayload {
    Text(String),
    Parsed(QueryDocument<'static, String>),
}

pub struct ExecutionRequest {
    pub document: OperationPayload,
    pub variables: Option<Map<String, Value>>,
    pub operation_name: Option<String>,
}

impl ExecutionRequest {
    pub fn into_envelope(self) -> GraphQLRequest {
        let query = match self.document {
            OperationPayload::Text(query) => query,
            OperationPayload::Parsed(document) => document.to_string(),
        };
        GraphQLRequest {
            query,
            variables: self.variables,
            operation_name: self.operation_name,
        }
    }
}

/// Fulfils an operation against a fragment by delegating to the owning
/// service over the broker.
pub type RemoteExecutor = Arc<
    dyn Fn(ExecutionRequest, GraphQLContext) -> BoxFuture<'static, Result<ExecutionResult, GraphQLError>>
        + Send
        + Sync,
>;

/// How instances of a type split across services are fetched for merging:
/// which root field to call, which field carries the key, and how the key is
/// passed.
#[derive(Clone, Debug)]
pub struct MergeTypeConfig {
    pub selection_set: String,
    pub key_field: String,
    pub field_name: String,
    pub key_arg: String,
    pub key_is_list: bool,
}

/// One remote subschema binding: a schema shell plus the executor that calls
/// back into the owning service.
pub struct Subschema {
    pub service_name: String,
    pub schema: Arc<BuiltSchema>,
    pub executor: RemoteExecutor,
    pub batch: bool,
    merge: HashMap<String, MergeTypeConfig>,
    canonical_types: HashSet<String>,
    computed: HashSet<(String, String)>,
}

impl Subschema {
    fn is_computed(&self, type_name: &str, field_name: &str) -> bool {
        self.computed
            .contains(&(type_name.to_string(), field_name.to_string()))
    }
}

struct MergeResolver {
    owner: usize,
    config: MergeTypeConfig,
}

struct RootField {
    owner: usize,
    type_name: String,
}

/// Discovers registered schema fragments and merges them into one composite
/// schema with federation-aware type merging.
pub struct GatewayStitcher {
    broker: Arc<dyn ServiceBroker>,
}

impl GatewayStitcher {
    pub fn new(broker: Arc<dyn ServiceBroker>) -> Self {
        GatewayStitcher { broker }
    }

    /// Build the composite schema from every currently registered service
    /// carrying a fragment. First occurrence wins for duplicate service
    /// names; zero fragments is a configuration error.
    pub fn stitch(&self) -> Result<StitchedSchema, SchemaError> {
        let services = self.broker.service_list();

        let mut processed = HashSet::new();
        let mut subschemas = Vec::new();

        for service in services {
            if !processed.insert(service.name.clone()) {
                continue;
            }
            let Some(settings) = service.settings.graphql else {
                continue;
            };

            let schema = Arc::new(BuiltSchema::shell(&settings.type_defs)?);
            let executor = make_remote_executor(&service.name, service.version);

            let mut subschema = Subschema {
                service_name: service.name,
                schema,
                executor,
                batch: settings.subschema_config.batch,
                merge: HashMap::new(),
                canonical_types: HashSet::new(),
                computed: HashSet::new(),
            };
            apply_stitching_directives(&mut subschema)?;
            subschemas.push(subschema);
        }

        if subschemas.is_empty() {
            return Err(SchemaError::NoGraphQLServices);
        }

        StitchedSchema::merge(subschemas)
    }
}

fn make_remote_executor(service_name: &str, version: Option<u32>) -> RemoteExecutor {
    let action = build_full_action_name(service_name, GRAPHQL_ACTION_NAME, version);

    Arc::new(move |request, context| {
        let action = action.clone();
        Box::pin(async move {
            let envelope = request.into_envelope();
            let payload = serde_json::to_value(&envelope).map_err(|err| {
                GraphQLError::new(format!("failed to encode request for `{action}`: {err}"))
            })?;

            let raw = context
                .call(&action, payload)
                .await
                .map_err(|err| GraphQLError::new(err.to_string()))?;

            serde_json::from_value::<ExecutionResult>(raw).map_err(|err| {
                GraphQLError::new(format!("malformed execution result from `{action}`: {err}"))
            })
        })
    })
}

/// Read `@key`, `@merge`, `@computed`, and `@canonical` usages out of the
/// advertised SDL into typed merge configuration.
fn apply_stitching_directives(subschema: &mut Subschema) -> Result<(), SchemaError> {
    let mut key_selections: HashMap<String, String> = HashMap::new();

    for definition in &subschema.schema.document.definitions {
        let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition else {
            continue;
        };

        for directive in &object.directives {
            match directive.name.as_str() {
                "key" => {
                    if let Some((_, AstValue::String(selection))) = directive
                        .arguments
                        .iter()
                        .find(|(name, _)| name == "selectionSet")
                    {
                        key_selections.insert(object.name.clone(), selection.clone());
                    }
                }
                "canonical" => {
                    subschema.canonical_types.insert(object.name.clone());
                }
                _ => {}
            }
        }

        for field in &object.fields {
            if field.directives.iter().any(|d| d.name == "computed") {
                subschema
                    .computed
                    .insert((object.name.clone(), field.name.clone()));
            }
        }
    }

    let Some(query_type) = subschema.schema.query_type.clone() else {
        return Ok(());
    };

    let mut merge = HashMap::new();
    for definition in &subschema.schema.document.definitions {
        let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition else {
            continue;
        };
        if object.name != query_type {
            continue;
        }

        for field in &object.fields {
            let Some(directive) = field.directives.iter().find(|d| d.name == "merge") else {
                continue;
            };

            let target = named_type(&field.field_type).to_string();
            let string_arg = |name: &str| {
                directive
                    .arguments
                    .iter()
                    .find(|(arg, _)| arg == name)
                    .and_then(|(_, value)| match value {
                        AstValue::String(value) => Some(value.clone()),
                        _ => None,
                    })
            };

            let selection_set = key_selections.get(&target).cloned();
            let key_field = match string_arg("keyField") {
                Some(key_field) => key_field,
                None => selection_set
                    .as_deref()
                    .and_then(|selection| parse_key_selection(selection).into_iter().next())
                    .ok_or_else(|| SchemaError::InvalidDirective {
                        directive: "merge".to_string(),
                        reason: format!("cannot derive a merge key for type `{target}`"),
                    })?,
            };

            let key_arg = match string_arg("keyArg") {
                Some(key_arg) => key_arg,
                None => field
                    .arguments
                    .first()
                    .map(|arg| arg.name.clone())
                    .ok_or_else(|| SchemaError::InvalidDirective {
                        directive: "merge".to_string(),
                        reason: format!("field `{}` takes no arguments", field.name),
                    })?,
            };

            let key_is_list = field
                .arguments
                .iter()
                .find(|arg| arg.name == key_arg)
                .map(|arg| type_is_list(&arg.value_type))
                .unwrap_or(false);

            let selection_set = selection_set.unwrap_or_else(|| format!("{{ {key_field} }}"));

            merge.entry(target).or_insert(MergeTypeConfig {
                selection_set,
                key_field,
                field_name: field.name.clone(),
                key_arg,
                key_is_list,
            });
        }
    }

    subschema.merge = merge;
    Ok(())
}

fn parse_key_selection(selection: &str) -> Vec<String> {
    let Ok(document) = parse_query::<String>(selection) else {
        return Vec::new();
    };

    for definition in &document.definitions {
        if let QueryDefinition::Operation(OperationDefinition::SelectionSet(selection_set)) =
            definition
        {
            return selection_set
                .items
                .iter()
                .filter_map(|item| match item {
                    Selection::Field(field) => Some(field.name.clone()),
                    _ => None,
                })
                .collect();
        }
    }

    Vec::new()
}

/// The gateway's composite schema: root-field routing, the merged type index,
/// merge resolvers, and the printed composite SDL. Immutable once produced;
/// topology changes require a full restitch.
pub struct StitchedSchema {
    subschemas: Vec<Subschema>,
    root_query: HashMap<String, RootField>,
    root_mutation: HashMap<String, RootField>,
    types: HashMap<String, HashMap<String, String>>,
    merges: HashMap<String, Vec<MergeResolver>>,
    type_defs: String,
}

impl StitchedSchema {
    fn merge(subschemas: Vec<Subschema>) -> Result<StitchedSchema, SchemaError> {
        let mut root_query: HashMap<String, RootField> = HashMap::new();
        let mut root_mutation: HashMap<String, RootField> = HashMap::new();
        let mut types: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut merges: HashMap<String, Vec<MergeResolver>> = HashMap::new();

        for (index, subschema) in subschemas.iter().enumerate() {
            let shell = &subschema.schema;

            for (routing, root_type) in [
                (&mut root_query, shell.query_type.as_deref()),
                (&mut root_mutation, shell.mutation_type.as_deref()),
            ] {
                let Some(root_type) = root_type else { continue };
                let Some(fields) = shell.types.get(root_type) else {
                    continue;
                };
                for (field_name, def) in fields {
                    routing.entry(field_name.clone()).or_insert(RootField {
                        owner: index,
                        type_name: def.type_name.clone(),
                    });
                }
            }

            for (type_name, fields) in &shell.types {
                if shell.query_type.as_deref() == Some(type_name)
                    || shell.mutation_type.as_deref() == Some(type_name)
                {
                    continue;
                }

                // canonical definitions override earlier non-canonical ones
                let is_canonical = subschema.canonical_types.contains(type_name);
                let entry = types.entry(type_name.clone()).or_default();
                for (field_name, def) in fields {
                    if is_canonical || !entry.contains_key(field_name) {
                        entry.insert(field_name.clone(), def.type_name.clone());
                    }
                }
            }

            for (type_name, config) in &subschema.merge {
                merges.entry(type_name.clone()).or_default().push(MergeResolver {
                    owner: index,
                    config: config.clone(),
                });
            }
        }

        let type_defs = print_composite(&subschemas);

        Ok(StitchedSchema {
            subschemas,
            root_query,
            root_mutation,
            types,
            merges,
            type_defs,
        })
    }

    pub fn type_defs(&self) -> &str {
        &self.type_defs
    }

    pub fn subschema_names(&self) -> Vec<&str> {
        self.subschemas
            .iter()
            .map(|subschema| subschema.service_name.as_str())
            .collect()
    }

    pub fn query_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.root_query.keys().map(String::as_str).collect();
        fields.sort_unstable();
        fields
    }

    pub fn mutation_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.root_mutation.keys().map(String::as_str).collect();
        fields.sort_unstable();
        fields
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
        self.execute_document(ctx, &document, variables, operation_name)
            .await
    }

    pub async fn execute_document(
        &self,
        ctx: GraphQLContext,
        document: &QueryDocument<'static, String>,
        variables: Option<&Map<String, Value>>,
        operation_name: Option<&str>,
    ) -> ExecutionResult {
        let fragments = collect_fragments(document);

        let operation = match select_operation(document, operation_name) {
            Ok(operation) => operation,
            Err(err) => return ExecutionResult::of_error(err),
        };

        let (routing, root_name) = match operation.kind {
            OperationKind::Query => (&self.root_query, "Query"),
            OperationKind::Mutation => (&self.root_mutation, "Mutation"),
            OperationKind::Subscription => {
                return ExecutionResult::of_error(GraphQLError::new(
                    "Subscriptions are not supported.",
                ));
            }
        };

        let variables = coerce_variable_values(operation.variable_definitions, variables);

        let delegation = Delegation {
            schema: self,
            ctx: &ctx,
            variables: &variables,
            variable_definitions: operation.variable_definitions,
            fragments: &fragments,
        };

        let mut data = Map::new();
        let mut errors = Vec::new();

        let root_fields = delegation.requested_fields(root_name, &operation.selection_set.items);
        let mut groups: Vec<(usize, Vec<&Field<'static, String>>)> = Vec::new();
        for field in root_fields {
            if field.name == "__typename" {
                data.insert(
                    response_key(field).to_string(),
                    Value::String(root_name.to_string()),
                );
                continue;
            }
            match routing.get(&field.name) {
                Some(root_field) => {
                    match groups.iter_mut().find(|(owner, _)| *owner == root_field.owner) {
                        Some((_, fields)) => fields.push(field),
                        None => groups.push((root_field.owner, vec![field])),
                    }
                }
                None => errors.push(
                    GraphQLError::new(format!(
                        "Cannot query field \"{}\" on type \"{}\".",
                        field.name, root_name
                    ))
                    .at(field.position),
                ),
            }
        }

        // One delegated call per owning subschema. Queries fan out in
        // parallel; mutations keep document order.
        let mut outcomes = Vec::with_capacity(groups.len());
        if operation.kind == OperationKind::Mutation {
            for (owner, fields) in &groups {
                let request = delegation.delegate_root_fields(*owner, operation.kind, fields);
                let outcome = (self.subschemas[*owner].executor)(request, ctx.clone()).await;
                outcomes.push((fields.clone(), outcome));
            }
        } else {
            let calls = groups.iter().map(|(owner, fields)| {
                let request = delegation.delegate_root_fields(*owner, operation.kind, fields);
                let executor = self.subschemas[*owner].executor.clone();
                let ctx = ctx.clone();
                let fields = fields.clone();
                async move { (fields, executor(request, ctx).await) }
            });
            outcomes = join_all(calls).await;
        }

        for (fields, outcome) in outcomes {
            match outcome {
                Err(err) => {
                    errors.push(err);
                    for field in fields {
                        data.insert(response_key(field).to_string(), Value::Null);
                    }
                }
                Ok(result) => {
                    errors.extend(result.errors);
                    let mut source = match result.data {
                        Some(Value::Object(map)) => map,
                        _ => Map::new(),
                    };
                    for field in fields {
                        let key = response_key(field);
                        let mut value = source.remove(key).unwrap_or(Value::Null);
                        let type_name = routing
                            .get(&field.name)
                            .map(|root_field| root_field.type_name.clone())
                            .unwrap_or_default();
                        delegation
                            .complete(
                                type_name,
                                &field.selection_set.items,
                                &mut value,
                                vec![PathSegment::Field(key.to_string())],
                                &mut errors,
                            )
                            .await;
                        data.insert(key.to_string(), value);
                    }
                }
            }
        }

        ExecutionResult {
            data: Some(Value::Object(data)),
            errors,
        }
    }
}

/// Per-request delegation state: the composite schema plus the operation's
/// variables and fragments.
struct Delegation<'a> {
    schema: &'a StitchedSchema,
    ctx: &'a GraphQLContext,
    variables: &'a Map<String, Value>,
    variable_definitions: &'a [VariableDefinition<'static, String>],
    fragments: &'a Fragments<'a>,
}

impl<'a> Delegation<'a> {
    fn delegate_root_fields(
        &self,
        owner: usize,
        kind: OperationKind,
        fields: &[&'a Field<'static, String>],
    ) -> ExecutionRequest {
        let subschema = &self.schema.subschemas[owner];
        let root_type = match kind {
            OperationKind::Mutation => subschema.schema.mutation_type.as_deref(),
            _ => subschema.schema.query_type.as_deref(),
        }
        .unwrap_or("Query")
        .to_string();

        let items = fields
            .iter()
            .map(|field| {
                let field_type = subschema
                    .schema
                    .field(&root_type, &field.name)
                    .map(|def| def.type_name.clone())
                    .unwrap_or_default();
                let selection_set =
                    self.filter_selection_set(owner, &field_type, &field.selection_set.items);
                Selection::Field(Field {
                    position: field.position,
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    arguments: field.arguments.clone(),
                    directives: field.directives.clone(),
                    selection_set,
                })
            })
            .collect();

        self.build_request(items, kind)
    }

    fn build_request(
        &self,
        items: Vec<Selection<'static, String>>,
        kind: OperationKind,
    ) -> ExecutionRequest {
        let used = collect_used_variables(&items);
        let variable_definitions: Vec<VariableDefinition<'static, String>> = self
            .variable_definitions
            .iter()
            .filter(|definition| used.contains(definition.name.as_str()))
            .cloned()
            .collect();
        let variables: Map<String, Value> = self
            .variables
            .iter()
            .filter(|(name, _)| used.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let selection_set = SelectionSet {
            span: empty_span(),
            items,
        };
        let operation = match kind {
            OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
                position: zero_pos(),
                name: None,
                variable_definitions,
                directives: Vec::new(),
                selection_set,
            }),
            _ => OperationDefinition::Query(Query {
                position: zero_pos(),
                name: None,
                variable_definitions,
                directives: Vec::new(),
                selection_set,
            }),
        };
        let document = QueryDocument {
            definitions: vec![QueryDefinition::Operation(operation)],
        };

        ExecutionRequest {
            document: OperationPayload::Parsed(document),
            variables: if variables.is_empty() {
                None
            } else {
                Some(variables)
            },
            operation_name: None,
        }
    }

    /// Keep what the target subschema declares, defer the rest. When fields
    /// are deferred on a merged type, the merge-key field is injected so the
    /// merge pass has something to key on.
    fn filter_selection_set(
        &self,
        owner: usize,
        type_name: &str,
        items: &'a [Selection<'static, String>],
    ) -> SelectionSet<'static, String> {
        let mut filtered = Vec::new();
        let mut dropped = false;
        let mut active_fragments = Vec::new();
        self.filter_into(
            owner,
            type_name,
            items,
            &mut filtered,
            &mut dropped,
            &mut active_fragments,
        );

        if dropped {
            if let Some(resolvers) = self.schema.merges.get(type_name) {
                for resolver in resolvers {
                    if resolver.owner == owner {
                        continue;
                    }
                    let key_field = resolver.config.key_field.as_str();
                    let already = filtered.iter().any(|selection| {
                        matches!(selection, Selection::Field(field) if field.name == key_field)
                    });
                    if !already {
                        filtered.push(Selection::Field(plain_field(key_field)));
                    }
                }
            }
        }

        SelectionSet {
            span: empty_span(),
            items: filtered,
        }
    }

    fn filter_into(
        &self,
        owner: usize,
        type_name: &str,
        items: &'a [Selection<'static, String>],
        out: &mut Vec<Selection<'static, String>>,
        dropped: &mut bool,
        active_fragments: &mut Vec<&'a str>,
    ) {
        let subschema = &self.schema.subschemas[owner];

        for selection in items {
            match selection {
                Selection::Field(field) => {
                    if field.name == "__typename" {
                        out.push(Selection::Field(Field {
                            position: field.position,
                            alias: field.alias.clone(),
                            name: field.name.clone(),
                            arguments: Vec::new(),
                            directives: field.directives.clone(),
                            selection_set: SelectionSet {
                                span: empty_span(),
                                items: Vec::new(),
                            },
                        }));
                        continue;
                    }

                    match subschema.schema.field(type_name, &field.name) {
                        Some(def) if !subschema.is_computed(type_name, &field.name) => {
                            let field_type = def.type_name.clone();
                            let selection_set = self.filter_selection_set(
                                owner,
                                &field_type,
                                &field.selection_set.items,
                            );
                            if !field.selection_set.items.is_empty()
                                && selection_set.items.is_empty()
                            {
                                *dropped = true;
                                continue;
                            }
                            out.push(Selection::Field(Field {
                                position: field.position,
                                alias: field.alias.clone(),
                                name: field.name.clone(),
                                arguments: field.arguments.clone(),
                                directives: field.directives.clone(),
                                selection_set,
                            }));
                        }
                        _ => *dropped = true,
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if active_fragments.contains(&spread.fragment_name.as_str()) {
                        continue;
                    }
                    let Some(fragment) = self.fragments.get(spread.fragment_name.as_str()) else {
                        continue;
                    };
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    if !subschema.schema.has_type(condition) {
                        *dropped = true;
                        continue;
                    }
                    active_fragments.push(&spread.fragment_name);
                    let selection_set =
                        self.filter_selection_set(owner, condition, &fragment.selection_set.items);
                    active_fragments.pop();
                    if !selection_set.items.is_empty() {
                        out.push(Selection::InlineFragment(
                            graphql_parser::query::InlineFragment {
                                position: spread.position,
                                type_condition: Some(TypeCondition::On(condition.clone())),
                                directives: spread.directives.clone(),
                                selection_set,
                            },
                        ));
                    }
                }
                Selection::InlineFragment(inline) => match &inline.type_condition {
                    Some(TypeCondition::On(condition)) => {
                        if !subschema.schema.has_type(condition) {
                            *dropped = true;
                            continue;
                        }
                        let selection_set = self.filter_selection_set(
                            owner,
                            condition,
                            &inline.selection_set.items,
                        );
                        if !selection_set.items.is_empty() {
                            out.push(Selection::InlineFragment(
                                graphql_parser::query::InlineFragment {
                                    position: inline.position,
                                    type_condition: inline.type_condition.clone(),
                                    directives: inline.directives.clone(),
                                    selection_set,
                                },
                            ));
                        }
                    }
                    None => {
                        self.filter_into(
                            owner,
                            type_name,
                            &inline.selection_set.items,
                            out,
                            dropped,
                            active_fragments,
                        );
                    }
                },
            }
        }
    }

    /// Fill in fields the origin subschema could not provide by delegating to
    /// the owning subschemas' merge fields, then prune anything the client
    /// did not ask for.
    fn complete<'b>(
        &'b self,
        type_name: String,
        items: &'a [Selection<'static, String>],
        value: &'b mut Value,
        path: Vec<PathSegment>,
        errors: &'b mut Vec<GraphQLError>,
    ) -> BoxFuture<'b, ()> {
        Box::pin(async move {
            if items.is_empty() {
                return;
            }

            match value {
                Value::Array(elements) => {
                    self.batch_merge(&type_name, items, elements, &path, errors)
                        .await;
                    for (index, element) in elements.iter_mut().enumerate() {
                        let mut element_path = path.clone();
                        element_path.push(PathSegment::Index(index));
                        self.complete(type_name.clone(), items, element, element_path, errors)
                            .await;
                    }
                }
                Value::Object(_) => {
                    self.complete_object(type_name, items, value, path, errors)
                        .await;
                }
                _ => {}
            }
        })
    }

    async fn complete_object(
        &self,
        type_name: String,
        items: &'a [Selection<'static, String>],
        value: &mut Value,
        path: Vec<PathSegment>,
        errors: &mut Vec<GraphQLError>,
    ) {
        let fields = self.requested_fields(&type_name, items);
        let requested: HashSet<String> = fields
            .iter()
            .map(|field| response_key(field).to_string())
            .collect();

        let Value::Object(object) = value else { return };

        for field in &fields {
            if field.name == "__typename" {
                object.insert(
                    response_key(field).to_string(),
                    Value::String(type_name.clone()),
                );
            }
        }

        let mut missing: Vec<&'a Field<'static, String>> = fields
            .iter()
            .copied()
            .filter(|field| {
                field.name != "__typename" && !object.contains_key(response_key(field))
            })
            .collect();

        if !missing.is_empty() {
            if let Some(resolvers) = self.schema.merges.get(type_name.as_str()) {
                for resolver in resolvers {
                    if missing.is_empty() {
                        break;
                    }
                    let subschema = &self.schema.subschemas[resolver.owner];
                    let owned: Vec<&'a Field<'static, String>> = missing
                        .iter()
                        .copied()
                        .filter(|field| {
                            subschema.schema.field(&type_name, &field.name).is_some()
                                && !subschema.is_computed(&type_name, &field.name)
                        })
                        .collect();
                    if owned.is_empty() {
                        continue;
                    }

                    self.merge_one(resolver, &type_name, &owned, object, &path, errors)
                        .await;
                    missing.retain(|field| {
                        !owned.iter().any(|merged| std::ptr::eq(*merged, *field))
                    });
                }
            }

            for field in &missing {
                let key = response_key(field);
                object.insert(key.to_string(), Value::Null);
                let mut field_path = path.clone();
                field_path.push(PathSegment::Field(key.to_string()));
                errors.push(
                    GraphQLError::new(format!(
                        "Cannot resolve field \"{}\" on type \"{}\" from any subschema.",
                        field.name, type_name
                    ))
                    .with_path(field_path),
                );
            }
        }

        for field in &fields {
            if field.selection_set.items.is_empty() {
                continue;
            }
            let key = response_key(field);
            let child_type = self
                .schema
                .types
                .get(type_name.as_str())
                .and_then(|fields| fields.get(&field.name))
                .cloned()
                .unwrap_or_default();
            if let Some(child) = object.get_mut(key) {
                let mut child_path = path.clone();
                child_path.push(PathSegment::Field(key.to_string()));
                self.complete(
                    child_type,
                    &field.selection_set.items,
                    child,
                    child_path,
                    errors,
                )
                .await;
            }
        }

        object.retain(|key, _| requested.contains(key));
    }

    async fn merge_one(
        &self,
        resolver: &MergeResolver,
        type_name: &str,
        fields: &[&'a Field<'static, String>],
        object: &mut Map<String, Value>,
        path: &[PathSegment],
        errors: &mut Vec<GraphQLError>,
    ) {
        let subschema = &self.schema.subschemas[resolver.owner];
        let config = &resolver.config;

        let Some(key_value) = object.get(&config.key_field).cloned() else {
            for field in fields {
                object.insert(response_key(field).to_string(), Value::Null);
            }
            errors.push(
                GraphQLError::new(format!(
                    "Merge key \"{}\" missing for type \"{}\".",
                    config.key_field, type_name
                ))
                .with_path(path.to_vec()),
            );
            return;
        };

        let key_argument = if config.key_is_list {
            AstValue::List(vec![json_to_ast_value(&key_value)])
        } else {
            json_to_ast_value(&key_value)
        };

        let mut selection = self.merge_selection(resolver.owner, type_name, fields);
        if config.key_is_list {
            ensure_field_selected(&mut selection, &config.key_field);
        }

        let merge_field = Field {
            position: zero_pos(),
            alias: None,
            name: config.field_name.clone(),
            arguments: vec![(config.key_arg.clone(), key_argument)],
            directives: Vec::new(),
            selection_set: selection,
        };
        let request =
            self.build_request(vec![Selection::Field(merge_field)], OperationKind::Query);

        match (subschema.executor.clone())(request, self.ctx.clone()).await {
            Err(err) => {
                for field in fields {
                    object.insert(response_key(field).to_string(), Value::Null);
                }
                errors.push(err.with_path(path.to_vec()));
            }
            Ok(result) => {
                for err in result.errors {
                    errors.push(reroot_error(err, path, &config.field_name));
                }

                let merged = result
                    .data
                    .and_then(|mut data| {
                        data.get_mut(&config.field_name).map(std::mem::take)
                    })
                    .map(|merged| {
                        if config.key_is_list {
                            match merged {
                                Value::Array(mut elements) if !elements.is_empty() => {
                                    elements.swap_remove(0)
                                }
                                _ => Value::Null,
                            }
                        } else {
                            merged
                        }
                    })
                    .unwrap_or(Value::Null);

                match merged {
                    Value::Object(merged) => {
                        for field in fields {
                            let key = response_key(field);
                            object.insert(
                                key.to_string(),
                                merged.get(key).cloned().unwrap_or(Value::Null),
                            );
                        }
                    }
                    _ => {
                        for field in fields {
                            object.insert(response_key(field).to_string(), Value::Null);
                        }
                    }
                }
            }
        }
    }

    /// Merge every instance in a list with one call when the merge field
    /// takes a list key and the owning fragment allows batching.
    async fn batch_merge(
        &self,
        type_name: &str,
        items: &'a [Selection<'static, String>],
        elements: &mut [Value],
        path: &[PathSegment],
        errors: &mut Vec<GraphQLError>,
    ) {
        let Some(resolvers) = self.schema.merges.get(type_name) else {
            return;
        };

        let fields = self.requested_fields(type_name, items);
        let missing: Vec<&'a Field<'static, String>> = fields
            .iter()
            .copied()
            .filter(|field| {
                field.name != "__typename"
                    && elements.iter().any(|element| {
                        element
                            .as_object()
                            .is_some_and(|object| !object.contains_key(response_key(field)))
                    })
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        for resolver in resolvers {
            let config = &resolver.config;
            let subschema = &self.schema.subschemas[resolver.owner];
            if !config.key_is_list || !subschema.batch {
                continue;
            }

            let owned: Vec<&'a Field<'static, String>> = missing
                .iter()
                .copied()
                .filter(|field| {
                    subschema.schema.field(type_name, &field.name).is_some()
                        && !subschema.is_computed(type_name, &field.name)
                })
                .collect();
            if owned.is_empty() {
                continue;
            }

            let keys: Vec<Value> = elements
                .iter()
                .filter_map(|element| element.get(&config.key_field).cloned())
                .filter(|key| !key.is_null())
                .collect();
            if keys.is_empty() {
                continue;
            }

            let mut selection = self.merge_selection(resolver.owner, type_name, &owned);
            ensure_field_selected(&mut selection, &config.key_field);

            let merge_field = Field {
                position: zero_pos(),
                alias: None,
                name: config.field_name.clone(),
                arguments: vec![(
                    config.key_arg.clone(),
                    AstValue::List(keys.iter().map(json_to_ast_value).collect()),
                )],
                directives: Vec::new(),
                selection_set: selection,
            };
            let request =
                self.build_request(vec![Selection::Field(merge_field)], OperationKind::Query);

            match (subschema.executor.clone())(request, self.ctx.clone()).await {
                Err(err) => {
                    for element in elements.iter_mut() {
                        if let Some(object) = element.as_object_mut() {
                            for field in &owned {
                                object.insert(response_key(field).to_string(), Value::Null);
                            }
                        }
                    }
                    errors.push(err.with_path(path.to_vec()));
                }
                Ok(result) => {
                    for err in result.errors {
                        errors.push(reroot_error(err, path, &config.field_name));
                    }

                    let mut by_key: HashMap<String, Map<String, Value>> = HashMap::new();
                    if let Some(Value::Array(merged)) = result
                        .data
                        .and_then(|mut data| data.get_mut(&config.field_name).map(std::mem::take))
                    {
                        for entry in merged {
                            if let Value::Object(entry) = entry {
                                if let Some(key) = entry.get(&config.key_field) {
                                    by_key.insert(json_key(key), entry);
                                }
                            }
                        }
                    }

                    for element in elements.iter_mut() {
                        let Some(object) = element.as_object_mut() else {
                            continue;
                        };
                        let matched = object
                            .get(&config.key_field)
                            .map(json_key)
                            .and_then(|key| by_key.get(&key));
                        for field in &owned {
                            let key = response_key(field);
                            let value = matched
                                .and_then(|merged| merged.get(key).cloned())
                                .unwrap_or(Value::Null);
                            object.insert(key.to_string(), value);
                        }
                    }
                }
            }
        }
    }

    fn merge_selection(
        &self,
        owner: usize,
        type_name: &str,
        fields: &[&'a Field<'static, String>],
    ) -> SelectionSet<'static, String> {
        let subschema = &self.schema.subschemas[owner];
        let items = fields
            .iter()
            .map(|field| {
                let field_type = subschema
                    .schema
                    .field(type_name, &field.name)
                    .map(|def| def.type_name.clone())
                    .unwrap_or_default();
                let selection_set =
                    self.filter_selection_set(owner, &field_type, &field.selection_set.items);
                Selection::Field(Field {
                    position: field.position,
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    arguments: field.arguments.clone(),
                    directives: field.directives.clone(),
                    selection_set,
                })
            })
            .collect();

        SelectionSet {
            span: empty_span(),
            items,
        }
    }

    fn requested_fields(
        &self,
        type_name: &str,
        items: &'a [Selection<'static, String>],
    ) -> Vec<&'a Field<'static, String>> {
        let mut out = Vec::new();
        let mut active_fragments = Vec::new();
        self.collect_fields(type_name, items, &mut active_fragments, &mut out);
        out
    }

    fn collect_fields(
        &self,
        type_name: &str,
        items: &'a [Selection<'static, String>],
        active_fragments: &mut Vec<&'a str>,
        out: &mut Vec<&'a Field<'static, String>>,
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

    fn type_condition_matches(&self, type_name: &str, condition: &str) -> bool {
        condition == type_name || !self.schema.types.contains_key(condition)
    }
}

/// Print the composite SDL: every definition from every fragment, merged
/// object types unioning their fields, later duplicates dropped.
fn print_composite(subschemas: &[Subschema]) -> String {
    let mut definitions: Vec<Definition<'static, String>> = Vec::new();
    let mut object_positions: HashMap<String, usize> = HashMap::new();
    let mut seen_names: HashSet<String> = HashSet::new();

    for subschema in subschemas {
        for definition in &subschema.schema.document.definitions {
            match definition {
                Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                    match object_positions.get(&object.name) {
                        Some(&position) => {
                            if let Definition::TypeDefinition(TypeDefinition::Object(merged)) =
                                &mut definitions[position]
                            {
                                for field in &object.fields {
                                    if !merged.fields.iter().any(|f| f.name == field.name) {
                                        merged.fields.push(field.clone());
                                    }
                                }
                            }
                        }
                        None => {
                            object_positions.insert(object.name.clone(), definitions.len());
                            definitions.push(definition.clone());
                        }
                    }
                }
                Definition::TypeDefinition(other) => {
                    let name = match other {
                        TypeDefinition::Scalar(def) => &def.name,
                        TypeDefinition::Interface(def) => &def.name,
                        TypeDefinition::Union(def) => &def.name,
                        TypeDefinition::Enum(def) => &def.name,
                        TypeDefinition::InputObject(def) => &def.name,
                        TypeDefinition::Object(_) => unreachable!(),
                    };
                    if seen_names.insert(format!("type:{name}")) {
                        definitions.push(definition.clone());
                    }
                }
                Definition::DirectiveDefinition(directive) => {
                    if seen_names.insert(format!("directive:{}", directive.name)) {
                        definitions.push(definition.clone());
                    }
                }
                Definition::SchemaDefinition(_) | Definition::TypeExtension(_) => {}
            }
        }
    }

    SchemaDocument { definitions }.to_string()
}

fn response_key<'b>(field: &'b Field<'static, String>) -> &'b str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// Stable string form of a merge-key value, used to match batch results back
/// to their source objects.
fn json_key(value: &Value) -> String {
    match value {
        Value::String(key) => key.clone(),
        other => other.to_string(),
    }
}

fn reroot_error(mut err: GraphQLError, base: &[PathSegment], root_field: &str) -> GraphQLError {
    let mut path = base.to_vec();
    let mut rest = err.path.into_iter();
    if let Some(first) = rest.next() {
        if !matches!(&first, PathSegment::Field(name) if name == root_field) {
            path.push(first);
        }
    }
    path.extend(rest);
    err.path = path;
    err
}

fn ensure_field_selected(selection_set: &mut SelectionSet<'static, String>, name: &str) {
    let present = selection_set
        .items
        .iter()
        .any(|selection| matches!(selection, Selection::Field(field) if field.name == name));
    if !present {
        selection_set.items.push(Selection::Field(plain_field(name)));
    }
}

fn plain_field(name: &str) -> Field<'static, String> {
    Field {
        position: zero_pos(),
        alias: None,
        name: name.to_string(),
        arguments: Vec::new(),
        directives: Vec::new(),
        selection_set: SelectionSet {
            span: empty_span(),
            items: Vec::new(),
        },
    }
}

fn zero_pos() -> Pos {
    Pos { line: 0, column: 0 }
}

fn empty_span() -> (Pos, Pos) {
    (zero_pos(), zero_pos())
}

fn collect_used_variables(items: &[Selection<'static, String>]) -> HashSet<String> {
    fn walk_value(value: &AstValue<'static, String>, out: &mut HashSet<String>) {
        match value {
            AstValue::Variable(name) => {
                out.insert(name.clone());
            }
            AstValue::List(items) => {
                for item in items {
                    walk_value(item, out);
                }
            }
            AstValue::Object(fields) => {
                for value in fields.values() {
                    walk_value(value, out);
                }
            }
            _ => {}
        }
    }

    fn walk_directives(
        directives: &[graphql_parser::query::Directive<'static, String>],
        out: &mut HashSet<String>,
    ) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                walk_value(value, out);
            }
        }
    }

    fn walk(items: &[Selection<'static, String>], out: &mut HashSet<String>) {
        for selection in items {
            match selection {
                Selection::Field(field) => {
                    for (_, value) in &field.arguments {
                        walk_value(value, out);
                    }
                    walk_directives(&field.directives, out);
                    walk(&field.selection_set.items, out);
                }
                Selection::InlineFragment(inline) => {
                    walk_directives(&inline.directives, out);
                    walk(&inline.selection_set.items, out);
                }
                Selection::FragmentSpread(spread) => {
                    walk_directives(&spread.directives, out);
                }
            }
        }
    }

    let mut out = HashSet::new();
    walk(items, &mut out);
    out
}
