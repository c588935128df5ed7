//! Parametric template expansion.
//!
//! A parameter `key*=*{expression}` turns its task into a template: the
//! expression is evaluated against the task's instance once per distinct
//! `(instance, expression)` pair, and the template is replaced by one
//! concrete task per member tuple of the cross product of all its
//! directives. Predecessor references to the template id fan out to
//! every produced child.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::{ParsedItem, Task};
use crate::remote::{ClientFactory, RemoteClient};

use super::ParseError;

/// Expand every template in `items`, preserving sequence positions.
/// Returns the expanded items and human-readable warnings.
pub async fn expand_templates(
    items: Vec<ParsedItem>,
    factory: &dyn ClientFactory,
    session_tag: &str,
) -> Result<(Vec<ParsedItem>, Vec<String>), ParseError> {
    let mut warnings = Vec::new();

    // One fetch per distinct (instance, expression), one connection per
    // distinct instance.
    let mut member_sets: HashMap<(String, String), Vec<String>> = HashMap::new();
    let mut clients: HashMap<String, Arc<dyn RemoteClient>> = HashMap::new();

    for item in &items {
        let ParsedItem::Template(task) = item else { continue };
        for (_, expression) in task.expansion_directives() {
            let key = (task.instance.clone(), expression.clone());
            if member_sets.contains_key(&key) {
                continue;
            }
            let client = match clients.get(&task.instance) {
                Some(c) => c.clone(),
                None => {
                    let c = factory.connect(&task.instance, session_tag).await.map_err(|e| {
                        ParseError::Expansion {
                            instance: task.instance.clone(),
                            expression: expression.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    clients.insert(task.instance.clone(), c.clone());
                    c
                }
            };
            let members = client.expand_members(&expression).await.map_err(|e| ParseError::Expansion {
                instance: task.instance.clone(),
                expression: expression.clone(),
                message: e.to_string(),
            })?;
            debug!(instance = %task.instance, %expression, count = members.len(), "Expanded member query");
            member_sets.insert(key, members);
        }
    }

    // Close expansion sessions; best effort.
    for client in clients.values() {
        if let Some(id) = client.session_id() {
            let _ = client.end_session(id).await;
        }
    }

    // Replace templates by their children, in place.
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut expanded: Vec<ParsedItem> = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ParsedItem::Template(template) => {
                let children = expand_one(&template, &member_sets);
                if children.is_empty() {
                    warnings.push(format!(
                        "template '{}' produced no members and was dropped",
                        template.id
                    ));
                    warn!(template = %template.id, "Template expansion produced no members");
                }
                children_of.insert(template.id.clone(), children.iter().map(|t| t.id.clone()).collect());
                expanded.extend(children.into_iter().map(ParsedItem::Task));
            }
            other => expanded.push(other),
        }
    }

    // Fan predecessor references to templates out to their children.
    for item in &mut expanded {
        let (ParsedItem::Task(task) | ParsedItem::Template(task)) = item else {
            continue;
        };
        let mut rewritten = Vec::with_capacity(task.predecessors.len());
        for pred in task.predecessors.drain(..) {
            match children_of.get(&pred) {
                Some(children) if children.is_empty() => {
                    warnings.push(format!(
                        "task '{}': predecessor '{}' expanded to nothing and was removed",
                        task.id, pred
                    ));
                }
                Some(children) => {
                    for child in children {
                        if !rewritten.contains(child) {
                            rewritten.push(child.clone());
                        }
                    }
                }
                None => rewritten.push(pred),
            }
        }
        task.predecessors = rewritten;
    }

    Ok((expanded, warnings))
}

/// Produce the concrete tasks for one template, ordered lexicographically
/// by member tuple.
fn expand_one(template: &Task, member_sets: &HashMap<(String, String), Vec<String>>) -> Vec<Task> {
    let directives = template.expansion_directives();

    let lists: Vec<&Vec<String>> = directives
        .iter()
        .map(|(_, expr)| &member_sets[&(template.instance.clone(), expr.clone())])
        .collect();
    if lists.iter().any(|l| l.is_empty()) {
        return Vec::new();
    }

    let mut tuples: Vec<Vec<String>> = vec![Vec::new()];
    for list in &lists {
        let mut next = Vec::with_capacity(tuples.len() * list.len());
        for tuple in &tuples {
            for member in list.iter() {
                let mut extended = tuple.clone();
                extended.push(member.clone());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples.sort();

    tuples
        .into_iter()
        .map(|tuple| {
            let mut child = template.clone();
            child.id = format!("{}_{}", template.id, tuple.join("_"));
            let mut member_iter = tuple.iter();
            child.parameters = template
                .parameters
                .iter()
                .map(|(k, v)| match k.strip_suffix('*') {
                    Some(bare) if v.starts_with("*{") && v.ends_with('}') => {
                        let member = member_iter.next().cloned().unwrap_or_default();
                        (bare.to_string(), member)
                    }
                    _ => (k.clone(), v.clone()),
                })
                .collect();
            child
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockCluster, MockFactory};

    fn template(id: &str) -> Task {
        Task::new(id, "prod", "load")
            .with_param("pRegion*", "*{[Region].Members}")
            .with_param("pYear", "2024")
    }

    #[tokio::test]
    async fn test_single_directive_expansion() {
        let cluster = MockCluster::new();
        cluster.set_members("prod", "[Region].Members", &["emea", "apac"]);
        let factory = MockFactory::new(cluster.clone());

        let items = vec![ParsedItem::Template(template("t"))];
        let (expanded, warnings) = expand_templates(items, factory.as_ref(), "RUSHTI_wf").await.unwrap();

        assert!(warnings.is_empty());
        let ids: Vec<&str> = expanded
            .iter()
            .map(|i| match i {
                ParsedItem::Task(t) => t.id.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["t_apac", "t_emea"]);

        let ParsedItem::Task(first) = &expanded[0] else { unreachable!() };
        assert_eq!(
            first.parameters,
            vec![
                ("pRegion".to_string(), "apac".to_string()),
                ("pYear".to_string(), "2024".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cross_product_is_lexicographic() {
        let cluster = MockCluster::new();
        cluster.set_members("prod", "[Region].Members", &["b", "a"]);
        cluster.set_members("prod", "[Year].Members", &["2", "1"]);
        let factory = MockFactory::new(cluster.clone());

        let t = Task::new("t", "prod", "load")
            .with_param("pRegion*", "*{[Region].Members}")
            .with_param("pYear*", "*{[Year].Members}");
        let (expanded, _) = expand_templates(vec![ParsedItem::Template(t)], factory.as_ref(), "tag")
            .await
            .unwrap();

        let ids: Vec<&str> = expanded
            .iter()
            .map(|i| match i {
                ParsedItem::Task(t) => t.id.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["t_a_1", "t_a_2", "t_b_1", "t_b_2"]);
    }

    #[tokio::test]
    async fn test_predecessor_references_fan_out() {
        let cluster = MockCluster::new();
        cluster.set_members("prod", "[Region].Members", &["emea", "apac"]);
        let factory = MockFactory::new(cluster.clone());

        let downstream = Task::new("report", "prod", "report").with_predecessors(["t"]);
        let items = vec![ParsedItem::Template(template("t")), ParsedItem::Task(downstream)];
        let (expanded, _) = expand_templates(items, factory.as_ref(), "tag").await.unwrap();

        let ParsedItem::Task(report) = &expanded[2] else {
            panic!("expected report task");
        };
        assert_eq!(report.predecessors, vec!["t_apac".to_string(), "t_emea".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_member_template_dropped() {
        let cluster = MockCluster::new();
        cluster.set_members("prod", "[Region].Members", &[]);
        let factory = MockFactory::new(cluster.clone());

        let downstream = Task::new("report", "prod", "report").with_predecessors(["t"]);
        let items = vec![ParsedItem::Template(template("t")), ParsedItem::Task(downstream)];
        let (expanded, warnings) = expand_templates(items, factory.as_ref(), "tag").await.unwrap();

        assert_eq!(expanded.len(), 1);
        let ParsedItem::Task(report) = &expanded[0] else {
            panic!("expected report task");
        };
        assert!(report.predecessors.is_empty());
        assert_eq!(warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_once_per_instance_and_expression() {
        let cluster = MockCluster::new();
        cluster.set_members("prod", "[Region].Members", &["x"]);
        let factory = MockFactory::new(cluster.clone());

        let items = vec![
            ParsedItem::Template(template("t1")),
            ParsedItem::Template(template("t2")),
        ];
        let (expanded, _) = expand_templates(items, factory.as_ref(), "tag").await.unwrap();
        assert_eq!(expanded.len(), 2);
        // One connection serves both templates
        assert_eq!(cluster.connects("prod"), 1);
    }

    #[tokio::test]
    async fn test_expansion_failure_is_fatal() {
        let cluster = MockCluster::new();
        let factory = MockFactory::new(cluster.clone());

        let err = expand_templates(vec![ParsedItem::Template(template("t"))], factory.as_ref(), "tag")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Expansion { .. }));
    }
}
