//! `taskroom seed`: replace the database contents with demo data.

use taskroom_protocol::TaskStatus;

use crate::paths;
use crate::persistence::Store;

const USERS: &[(&str, &str, &str)] = &[
    ("user-alice", "Alice Johnson", "alice@example.com"),
    ("user-bob", "Bob Smith", "bob@example.com"),
    ("user-charlie", "Charlie Brown", "charlie@example.com"),
];

struct SeedProject {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    owner: &'static str,
    members: &'static [&'static str],
    tasks: &'static [(&'static str, &'static str, TaskStatus)],
    messages: &'static [(&'static str, &'static str)],
}

const PROJECTS: &[SeedProject] = &[
    SeedProject {
        id: "project-website",
        name: "Website Redesign",
        description: "Redesign the company website with modern UI/UX",
        owner: "user-alice",
        members: &["user-bob"],
        tasks: &[
            ("task-homepage", "Design homepage", TaskStatus::Todo),
            ("task-navigation", "Implement responsive navigation", TaskStatus::InProgress),
            ("task-images", "Optimize images", TaskStatus::Todo),
        ],
        messages: &[
            (
                "user-alice",
                "I've started working on the homepage design. What do you think about the color scheme?",
            ),
            (
                "user-bob",
                "The color scheme looks great! I think we should also consider adding more white space.",
            ),
        ],
    },
    SeedProject {
        id: "project-mobile",
        name: "Mobile App Development",
        description: "Build a cross-platform mobile app",
        owner: "user-bob",
        members: &["user-charlie", "user-alice"],
        tasks: &[
            ("task-scaffold", "Set up the app project", TaskStatus::Done),
            ("task-icon", "Design app icon", TaskStatus::InProgress),
            ("task-auth", "Implement user authentication", TaskStatus::Todo),
        ],
        messages: &[("user-bob", "Project scaffold is done, picking up authentication next.")],
    },
];

pub async fn run() -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let db_path = paths::db_path();
    let store = Store::open(&db_path)?;

    println!();
    println!("  Seeding {}", db_path.display());

    store.clear_all().await?;

    for &(id, name, email) in USERS {
        store.create_user(id, Some(name), Some(email)).await?;
    }
    println!("  Users: {}", USERS.len());

    for project in PROJECTS {
        store
            .create_project(project.id, project.name, Some(project.description), project.owner)
            .await?;
        for &member in project.members {
            store.add_member(project.id, member).await?;
        }
        for &(task_id, title, status) in project.tasks {
            store.create_task(task_id, project.id, title, status).await?;
        }
        for &(sender, content) in project.messages {
            store
                .create_message_if_authorized(sender, project.id, content)
                .await?;
        }
        println!(
            "  Project: {} ({}), {} members, {} tasks",
            project.name,
            project.id,
            project.members.len() + 1,
            project.tasks.len()
        );
    }

    println!();
    println!("  Connect with: /ws?token=<token>&userId=user-alice");
    println!();
    Ok(())
}
