use graphql_parser::query::{
    Definition, Document, Field, OperationDefinition, Selection, SelectionSet,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::GraphQLError;

pub const INTROSPECTION_DISABLED_MESSAGE: &str =
    "GraphQL introspection is not allowed, but the query contained __schema or __type";

/// One document-level validation rule. Rules run before execution; any error
/// aborts the request with a validation failure.
pub trait ValidationRule: Send + Sync {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError>;
}

/// An ordered rule chain. Every rule runs; errors accumulate in rule order.
#[derive(Clone, Default)]
pub struct Validator {
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl Validator {
    pub fn validate(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        self.rules
            .iter()
            .flat_map(|rule| rule.check(document))
            .collect()
    }
}

#[derive(Clone)]
pub struct CreateValidateOptions {
    /// Allow introspection queries.
    pub introspection: bool,
    /// Additional validation rules, appended after the built-in ones.
    pub validation_rules: Vec<Arc<dyn ValidationRule>>,
}

impl Default for CreateValidateOptions {
    fn default() -> Self {
        CreateValidateOptions {
            introspection: true,
            validation_rules: Vec::new(),
        }
    }
}

/// Build the validation pipeline: the introspection-disable rule first when
/// introspection is off, then the built-in document rules, then any extras.
pub fn create_validate(opts: CreateValidateOptions) -> Validator {
    let mut rules: Vec<Arc<dyn ValidationRule>> = Vec::new();
    if !opts.introspection {
        rules.push(Arc::new(DisableIntrospectionRule));
    }
    rules.push(Arc::new(KnownFragmentNamesRule));
    rules.push(Arc::new(NoFragmentCyclesRule));
    rules.push(Arc::new(LoneAnonymousOperationRule));
    rules.extend(opts.validation_rules);
    Validator { rules }
}

/// Rejects any query selecting `__schema` or `__type`.
pub struct DisableIntrospectionRule;

impl ValidationRule for DisableIntrospectionRule {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        let mut errors = Vec::new();
        visit_fields(document, &mut |field| {
            if field.name == "__schema" || field.name == "__type" {
                errors.push(GraphQLError::new(INTROSPECTION_DISABLED_MESSAGE).at(field.position));
            }
        });
        errors
    }
}

/// Fails operations whose selection nesting exceeds the configured depth.
pub struct DepthLimitRule {
    max_depth: usize,
}

impl DepthLimitRule {
    pub fn new(max_depth: usize) -> Self {
        DepthLimitRule { max_depth }
    }
}

impl ValidationRule for DepthLimitRule {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        let fragments = fragment_map(document);
        let mut errors = Vec::new();

        for definition in &document.definitions {
            let Definition::Operation(operation) = definition else {
                continue;
            };
            let (name, selection_set) = operation_parts(operation);
            let mut active = Vec::new();
            let depth = selection_depth(selection_set, &fragments, &mut active);
            if depth > self.max_depth {
                errors.push(GraphQLError::new(format!(
                    "'{}' exceeds maximum operation depth of {}",
                    name.unwrap_or(""),
                    self.max_depth
                )));
            }
        }

        errors
    }
}

pub struct KnownFragmentNamesRule;

impl ValidationRule for KnownFragmentNamesRule {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        let fragments = fragment_map(document);
        let mut errors = Vec::new();
        visit_selection_sets(document, &mut |selection_set| {
            for selection in &selection_set.items {
                if let Selection::FragmentSpread(spread) = selection {
                    if !fragments.contains_key(spread.fragment_name.as_str()) {
                        errors.push(
                            GraphQLError::new(format!(
                                "Unknown fragment \"{}\".",
                                spread.fragment_name
                            ))
                            .at(spread.position),
                        );
                    }
                }
            }
        });
        errors
    }
}

pub struct NoFragmentCyclesRule;

impl ValidationRule for NoFragmentCyclesRule {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        let fragments = fragment_map(document);
        let mut errors = Vec::new();

        for (name, fragment) in &fragments {
            let mut active = vec![*name];
            if has_cycle(&fragment.selection_set, &fragments, &mut active) {
                errors.push(GraphQLError::new(format!(
                    "Cannot spread fragment \"{name}\" within itself."
                )));
            }
        }

        errors
    }
}

pub struct LoneAnonymousOperationRule;

impl ValidationRule for LoneAnonymousOperationRule {
    fn check(&self, document: &Document<'static, String>) -> Vec<GraphQLError> {
        let operations: Vec<_> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::Operation(operation) => Some(operation),
                _ => None,
            })
            .collect();

        if operations.len() < 2 {
            return Vec::new();
        }

        operations
            .iter()
            .filter(|operation| operation_parts(operation).0.is_none())
            .map(|_| GraphQLError::new("This anonymous operation must be the only defined operation."))
            .collect()
    }
}

type FragmentMap<'a> =
    HashMap<&'a str, &'a graphql_parser::query::FragmentDefinition<'static, String>>;

fn fragment_map<'a>(document: &'a Document<'static, String>) -> FragmentMap<'a> {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
            _ => None,
        })
        .collect()
}

fn operation_parts<'a>(
    operation: &'a OperationDefinition<'static, String>,
) -> (Option<&'a str>, &'a SelectionSet<'static, String>) {
    match operation {
        OperationDefinition::SelectionSet(selection_set) => (None, selection_set),
        OperationDefinition::Query(query) => (query.name.as_deref(), &query.selection_set),
        OperationDefinition::Mutation(mutation) => {
            (mutation.name.as_deref(), &mutation.selection_set)
        }
        OperationDefinition::Subscription(subscription) => {
            (subscription.name.as_deref(), &subscription.selection_set)
        }
    }
}

fn visit_fields<'a>(
    document: &'a Document<'static, String>,
    visit: &mut impl FnMut(&'a Field<'static, String>),
) {
    visit_selection_sets(document, &mut |selection_set| {
        for selection in &selection_set.items {
            if let Selection::Field(field) = selection {
                visit(field);
            }
        }
    });
}

fn visit_selection_sets<'a>(
    document: &'a Document<'static, String>,
    visit: &mut impl FnMut(&'a SelectionSet<'static, String>),
) {
    fn walk<'a>(
        selection_set: &'a SelectionSet<'static, String>,
        visit: &mut impl FnMut(&'a SelectionSet<'static, String>),
    ) {
        visit(selection_set);
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => walk(&field.selection_set, visit),
                Selection::InlineFragment(inline) => walk(&inline.selection_set, visit),
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    for definition in &document.definitions {
        match definition {
            Definition::Operation(operation) => walk(operation_parts(operation).1, visit),
            Definition::Fragment(fragment) => walk(&fragment.selection_set, visit),
        }
    }
}

fn selection_depth<'a>(
    selection_set: &'a SelectionSet<'static, String>,
    fragments: &FragmentMap<'a>,
    active: &mut Vec<&'a str>,
) -> usize {
    selection_set
        .items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => 1 + selection_depth(&field.selection_set, fragments, active),
            Selection::InlineFragment(inline) => {
                selection_depth(&inline.selection_set, fragments, active)
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.fragment_name.as_str();
                if active.contains(&name) {
                    return 0;
                }
                match fragments.get(name) {
                    Some(fragment) => {
                        active.push(name);
                        let depth = selection_depth(&fragment.selection_set, fragments, active);
                        active.pop();
                        depth
                    }
                    None => 0,
                }
            }
        })
        .max()
        .unwrap_or(0)
}

fn has_cycle<'a>(
    selection_set: &'a SelectionSet<'static, String>,
    fragments: &FragmentMap<'a>,
    active: &mut Vec<&'a str>,
) -> bool {
    selection_set.items.iter().any(|selection| match selection {
        Selection::Field(field) => has_cycle(&field.selection_set, fragments, active),
        Selection::InlineFragment(inline) => has_cycle(&inline.selection_set, fragments, active),
        Selection::FragmentSpread(spread) => {
            let name = spread.fragment_name.as_str();
            if active.contains(&name) {
                return true;
            }
            match fragments.get(name) {
                Some(fragment) => {
                    active.push(name);
                    let cyclic = has_cycle(&fragment.selection_set, fragments, active);
                    active.pop();
                    cyclic
                }
                None => false,
            }
        }
    })
}
