use bollard::{container::ListContainersOptions, Docker};
use testbed_core::service::Catalogue;
use testbed_error::{ErrorContext as _, GenericError};
use tracing::debug;

const STACK_VERSION_LABEL: &str = "co.elastic.apm.stack-version";

/// Prints every container that carries the stack version label.
pub async fn run_status() -> Result<(), GenericError> {
    let docker = Docker::connect_with_defaults().error_context("Failed to connect to the Docker daemon.")?;

    let list_options = Some(ListContainersOptions {
        all: true,
        filters: vec![("label", vec![STACK_VERSION_LABEL])].into_iter().collect(),
        ..Default::default()
    });
    let containers = docker
        .list_containers(list_options)
        .await
        .error_context("Failed to list containers.")?;
    debug!(containers = containers.len(), "Listed composed containers.");

    if containers.is_empty() {
        println!("No composed containers found.");
        return Ok(());
    }

    let rows = containers
        .iter()
        .map(|container| {
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let version = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(STACK_VERSION_LABEL))
                .cloned()
                .unwrap_or_default();
            [
                name,
                container.image.clone().unwrap_or_default(),
                container.state.clone().unwrap_or_default(),
                container.status.clone().unwrap_or_default(),
                version,
            ]
        })
        .collect::<Vec<_>>();

    print!("{}", render_table(["NAME", "IMAGE", "STATE", "STATUS", "STACK VERSION"], &rows));
    Ok(())
}

/// Prints every service kind in the catalogue.
pub fn list_services(catalogue: &Catalogue) {
    print!("{}", render_services(catalogue));
}

fn render_services(catalogue: &Catalogue) -> String {
    let rows = catalogue
        .iter()
        .map(|kind| {
            [
                kind.name.to_string(),
                kind.category.as_str().to_string(),
                kind.port.map(|port| port.to_string()).unwrap_or_default(),
                if kind.enabled_by_default { "yes" } else { "no" }.to_string(),
                if kind.is_toggleable() { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    render_table(["SERVICE", "CATEGORY", "PORT", "DEFAULT", "TOGGLEABLE"], &rows)
}

/// Renders left-aligned columns separated by two spaces, one line per row after the header.
fn render_table<const N: usize>(header: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = header.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_line = |cells: Vec<&str>| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    };

    push_line(header.to_vec());
    for row in rows {
        push_line(row.iter().map(String::as_str).collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_columns_are_aligned() {
        let rows = [
            ["opbeans-go".to_string(), "3003".to_string()],
            ["kafka".to_string(), String::new()],
        ];
        assert_eq!(
            render_table(["SERVICE", "PORT"], &rows),
            "SERVICE     PORT\nopbeans-go  3003\nkafka\n"
        );
    }

    #[test]
    fn service_list_has_a_line_per_kind() {
        let catalogue = Catalogue::standard();
        let rendered = render_services(&catalogue);
        assert_eq!(rendered.lines().count(), catalogue.iter().count() + 1);
        assert!(rendered.lines().any(|line| line.starts_with("opbeans-go ")));
    }
}
