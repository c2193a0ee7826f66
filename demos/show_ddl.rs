use quarry::backend::LiveColumn;
use quarry::migration::{PatternReverser, ReverseStrategy};
use quarry::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Player {
    id: u64,
    name: String,
    email: String,
    score: i32,
    guild_id: Option<u64>,
}

impl Entity for Player {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::BigInt).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("name", ColumnType::Varchar).length(64))
            .column(ColumnDef::new("email", ColumnType::Varchar).unique())
            .column(ColumnDef::new("score", ColumnType::Int).default_value("0"))
            .column(ColumnDef::new("guild_id", ColumnType::BigInt).unsigned().nullable())
            .relation(
                RelationDef::belongs_to::<Guild>("guild").on_delete(ReferentialAction::SetNull),
            )
            .relation(RelationDef::belongs_to_many::<Item>("items"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Guild {
    id: u64,
    title: String,
}

impl Entity for Guild {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::BigInt).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("title", ColumnType::Varchar).length(128))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Item {
    id: u64,
    label: String,
}

impl Entity for Item {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::BigInt).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("label", ColumnType::Varchar))
    }
}

fn print_plan(title: &str, statements: &[String]) {
    println!("{}:", title);
    if statements.is_empty() {
        println!("  (nothing to do)");
    }
    for (i, statement) in statements.iter().enumerate() {
        println!("  {}. {}", i + 1, statement);
    }
    println!();
}

fn main() -> quarry::Result<()> {
    let mut sync = SchemaSync::new();
    sync.register::<Player>()?
        .register::<Guild>()?
        .register::<Item>()?;

    let mut empty = MockExecutor::new();
    let plan = sync.generate(&mut empty)?;
    let up = plan.statements();
    print_plan("Fresh database", &up);
    print_plan("Reversal", &PatternReverser.reverse_all(&up));

    // a players table from an older release: narrower name, no guild link
    let mut drifted = MockExecutor::new();
    drifted
        .set_table(
            "players",
            vec![
                LiveColumn::new("id", "bigint(20) unsigned", false).with_extra("auto_increment"),
                LiveColumn::new("name", "varchar(32)", false),
                LiveColumn::new("email", "varchar(255)", false),
                LiveColumn::new("score", "int(11)", false).with_default("0"),
                LiveColumn::new("nickname", "varchar(32)", true),
            ],
        )
        .set_indexes("players", &["PRIMARY", "players_email_unique"]);
    print_plan("Drifted players table", &sync.generate(&mut drifted)?.statements());

    Ok(())
}
